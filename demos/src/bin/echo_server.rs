use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use bytes::BytesMut;
use clap::Parser;
use log::info;

use strand::{Channel, Handler, HandlerContext, Message, ServerBootstrap};
use strand_tcp::TcpServerChannel;

struct EchoHandler;

impl Handler for EchoHandler {
    fn active(&self, ctx: &HandlerContext) {
        if let Some(channel) = ctx.channel() {
            info!("{:?} connected", channel.remote_addr());
        }
        ctx.fire_active();
    }

    fn inactive(&self, ctx: &HandlerContext) {
        if let Some(channel) = ctx.channel() {
            info!("{:?} disconnected", channel.remote_addr());
        }
        ctx.fire_inactive();
    }

    fn read(&self, ctx: &HandlerContext, msg: Message) {
        if let Ok(data) = msg.downcast::<BytesMut>() {
            info!("echoing {} bytes", data.len());
            ctx.write(Some(data), None);
        }
    }
}

#[derive(Parser)]
#[command(name = "Echo Server")]
#[command(about = "An echo server built on strand-tcp", long_about = None)]
struct Cli {
    #[arg(long, default_value_t = format!("0.0.0.0"))]
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

    let mut bootstrap = ServerBootstrap::new();
    bootstrap
        .channel::<TcpServerChannel>()
        .child_handler(Arc::new(EchoHandler));

    let bound = bootstrap.bind(Some(addr));
    bound.wait();
    anyhow::ensure!(bound.is_success(), "bind to {} failed", addr);
    let server = bound
        .channel()
        .ok_or_else(|| anyhow::anyhow!("server channel gone"))?;

    info!("listening on {}...", addr);
    info!("press ctrl-c to stop, try `nc {} {}` in another shell", cli.host, cli.port);

    let closer = server.clone();
    ctrlc::set_handler(move || {
        closer.close();
    })?;

    server.close_future().wait();
    info!("server is down");
    Ok(())
}
