//! Dummy TCS client: replays a command file against the server's control
//! port, then stops and kills the observation. For exercising the server in
//! test mode; not part of normal operation.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Command file with one TCS command per line. A built-in observation
    /// script is used when absent.
    command_file: Option<std::path::PathBuf>,
    /// Control endpoint of the running server.
    #[arg(long, default_value = "127.0.0.1:8080")]
    server: String,
    /// Seconds to keep observing between `start` and `stop`.
    #[arg(long, default_value_t = 4.0)]
    dwell: f64,
}

fn default_script() -> Vec<String> {
    [
        "pid TEST",
        "observer D Fault",
        "src Src1",
        "ra 12:34:56",
        "dec -45:00:00",
        "freq 1420.405",
        "band 400",
        "nbeam 13",
        "refbeam 1",
        "MB01_raj 188.73",
        "MB01_dcj -45.00",
        "start",
    ]
    .map(str::to_string)
    .to_vec()
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let commands: Vec<String> = match &args.command_file {
        Some(path) => {
            println!("loading command file: {}", path.display());
            std::fs::read_to_string(path)?
                .lines()
                .map(str::to_string)
                .collect()
        }
        None => default_script(),
    };

    println!("connecting to {}", args.server);
    let mut stream = TcpStream::connect(&args.server)?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut send = |cmd: &str| -> Result<()> {
        println!("CMD: {}", cmd);
        stream.write_all(cmd.as_bytes())?;
        stream.write_all(b"\n")?;
        let mut reply = String::new();
        reader.read_line(&mut reply)?;
        print!("  -> {}", reply);
        std::thread::sleep(Duration::from_millis(50));
        Ok(())
    };

    for cmd in &commands {
        let cmd = cmd.trim();
        if !cmd.is_empty() {
            send(cmd)?;
        }
    }

    println!("observing for {} s", args.dwell);
    std::thread::sleep(Duration::from_secs_f64(args.dwell));
    send("stop")?;
    std::thread::sleep(Duration::from_secs(2));
    send("kill")?;
    Ok(())
}
