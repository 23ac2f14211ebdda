//! Ping-pong between two unprivileged children, brokered by the parent.
//!
//! `bar` opens with a PING to `foo`; the two then answer each other
//! forever, one round trip per second. Run with `RUST_LOG=info`.

use privsplit::{Error, Runtime, Topology};
use std::{process, sync::Arc, time::Duration};
use tokio::time::sleep;

const PING: u32 = 100;
const PONG: u32 = 101;

async fn parent_main(_runtime: Arc<Runtime>) -> Result<(), Error> {
    std::future::pending().await
}

async fn foo_main(_runtime: Arc<Runtime>) -> Result<(), Error> {
    std::future::pending().await
}

async fn bar_main(runtime: Arc<Runtime>) -> Result<(), Error> {
    runtime.peer("foo")?.send(PING, b"test", None).await?;
    std::future::pending().await
}

#[tokio::main]
async fn main() {
    let _guard = privsplit_log::sync_logger("pingpong", true).expect("logger");

    let mut topology = Topology::new();

    topology.parent("parent", parent_main);

    topology
        .child("foo", foo_main)
        .talks_to(["bar"])
        .pre_start(|runtime| {
            let name = runtime.current().to_string();
            runtime.peer("bar")?.register_handler(PING, move |msg| {
                let name = name.clone();
                async move {
                    privsplit_log::info!("[{}] received PING", name);
                    sleep(Duration::from_secs(1)).await;
                    msg.reply(PONG, b"test", None).await
                }
            });
            Ok(())
        });

    topology
        .child("bar", bar_main)
        .talks_to(["foo"])
        .pre_start(|runtime| {
            let name = runtime.current().to_string();
            runtime.peer("foo")?.register_handler(PONG, move |msg| {
                let name = name.clone();
                async move {
                    privsplit_log::info!("[{}] received PONG", name);
                    sleep(Duration::from_secs(1)).await;
                    msg.reply(PING, b"test", None).await
                }
            });
            Ok(())
        });

    if let Err(err) = topology.start().await {
        privsplit_log::error!("{}", err);
        process::exit(1);
    }
}
