//! Descriptor passing between peers.
//!
//! `bar` opens a pipe and ships the write end to `foo` inside a
//! message; `foo` writes a greeting on the received descriptor and
//! `bar` reads it back from the end it kept.

use nix::unistd::{pipe, read, write};
use privsplit::{Error, Fd, Runtime, Topology};
use std::{os::unix::io::AsRawFd, process, sync::Arc};

const TAKE_PIPE: u32 = 100;

async fn parent_main(_runtime: Arc<Runtime>) -> Result<(), Error> {
    std::future::pending().await
}

async fn foo_main(_runtime: Arc<Runtime>) -> Result<(), Error> {
    std::future::pending().await
}

async fn bar_main(runtime: Arc<Runtime>) -> Result<(), Error> {
    let (rx, tx) = pipe()?;
    let rx = Fd::from(rx);

    runtime
        .peer("foo")?
        .send(TAKE_PIPE, b"", Some(Fd::from(tx)))
        .await?;

    // The pipe read blocks until foo writes; keep it off the runtime
    // worker threads.
    let greeting = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 64];
        read(rx.as_raw_fd(), &mut buf).map(|n| buf[..n].to_vec())
    })
    .await
    .expect("pipe reader task")?;

    privsplit_log::info!(
        "[bar] read {:?} from the pipe",
        String::from_utf8_lossy(&greeting)
    );

    std::future::pending().await
}

#[tokio::main]
async fn main() {
    let _guard = privsplit_log::sync_logger("fdpass", true).expect("logger");

    let mut topology = Topology::new();

    topology.parent("parent", parent_main);

    topology
        .child("foo", foo_main)
        .talks_to(["bar"])
        .pre_start(|runtime| {
            runtime
                .peer("bar")?
                .register_handler(TAKE_PIPE, |mut msg| async move {
                    let fd = msg.take_fd().ok_or(Error::Protocol("expected a descriptor"))?;
                    write(fd.as_raw_fd(), b"hello\n")?;
                    privsplit_log::info!("[foo] wrote the greeting");
                    Ok(())
                });
            Ok(())
        });

    topology.child("bar", bar_main).talks_to(["foo"]);

    if let Err(err) = topology.start().await {
        privsplit_log::error!("{}", err);
        process::exit(1);
    }
}
