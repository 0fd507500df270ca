use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const DEFAULT_ADDR: &str = "127.0.0.1:8080";

async fn connect(addr: &str, wait: bool) -> std::io::Result<TcpStream> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) if wait => {
                eprintln!("line-client: {addr} unavailable ({err}); retrying");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let wait = std::env::args().any(|a| a == "--wait");
    let addr = std::env::args()
        .skip(1)
        .find(|a| !a.starts_with("--"))
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    println!("line-client: connecting to {addr}");
    let stream = connect(&addr, wait).await?;
    println!("line-client: connected; type commands such as `switch_on,light.kitchen`");

    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = stdin.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            println!("-> {line}");
            if out_tx.send(format!("{line}\n")).is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        println!("<- {line}");
    }
    println!("line-client: connection closed by bridge");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    run().await
}
