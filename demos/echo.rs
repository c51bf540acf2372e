//! Minimal echo server under supervision.
//!
//! ```text
//! cargo run --example echo -- 7000
//! printf 'hi\n' | nc 127.0.0.1 7000
//! ```

use std::io::{Read, Write};

use forkvisor::{HandlerFn, Options, Supervisor};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let port = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<u16>())
        .transpose()?
        .unwrap_or(7000);

    let options = Options::default()
        .min_processes(2)
        .max_processes(8)
        .max_threads(4);
    let supervisor = Supervisor::bind_address("127.0.0.1", port, options)?;
    println!("echoing on 127.0.0.1:{port}");

    supervisor.start(HandlerFn::arc(|mut stream, _peer, _worker| {
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            stream.write_all(&buf[..n])?;
        }
    }));
    Ok(())
}
