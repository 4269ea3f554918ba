use std::io::BufRead;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use bytes::BytesMut;
use clap::Parser;
use log::info;

use strand::{Bootstrap, Channel, Handler, HandlerContext, Message};
use strand_tcp::TcpChannel;

struct PrintHandler;

impl Handler for PrintHandler {
    fn read(&self, _ctx: &HandlerContext, msg: Message) {
        if let Ok(data) = msg.downcast::<BytesMut>() {
            print!("{}", String::from_utf8_lossy(&data));
        }
    }
}

#[derive(Parser)]
#[command(name = "Echo Client")]
#[command(about = "Line-based client for the strand echo server", long_about = None)]
struct Cli {
    #[arg(long, default_value_t = format!("127.0.0.1"))]
    host: String,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_level = log::LevelFilter::from_str(&cli.log_level)?;
    env_logger::Builder::new().filter(None, log_level).init();

    let addr = SocketAddr::from_str(&format!("{}:{}", cli.host, cli.port))?;

    let mut bootstrap = Bootstrap::new();
    bootstrap
        .channel::<TcpChannel>()
        .handler(Arc::new(PrintHandler));

    let connected = bootstrap.connect(None, Some(addr));
    connected.wait();
    anyhow::ensure!(connected.is_success(), "connect to {} failed", addr);
    let channel = connected
        .channel()
        .ok_or_else(|| anyhow::anyhow!("client channel gone"))?;

    info!("connected to {}, type lines to echo, ctrl-c to quit", addr);

    let closer = channel.clone();
    ctrlc::set_handler(move || {
        closer.close();
    })?;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let mut line = line?;
        if !channel.is_active() {
            break;
        }
        line.push('\n');
        channel.write(Some(Box::new(line.into_bytes())));
    }

    channel.close().wait();
    channel.close_future().wait();
    Ok(())
}
