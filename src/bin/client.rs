//! StageFS demo client executable: write a checkpoint file, fsync it, and
//! read it back through the burst buffer.

use std::net::SocketAddr;

use clap::Parser;
use env_logger::Env;
use rand::Rng;
use tokio::runtime::Builder;

use stagefs::{
    pf_error, pf_info, AppId, ClientId, FileAttr, StagefsClient,
    StagefsError,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Application id shared by all clients of this job.
    #[arg(short, long, default_value_t = 1)]
    app_id: AppId,

    /// My client id on this node.
    #[arg(short, long, default_value_t = 0)]
    client_id: ClientId,

    /// Node-local delegator address.
    #[arg(short, long, default_value_t = String::from("127.0.0.1:47200"))]
    server: String,

    /// File id to write and read back.
    #[arg(short, long, default_value_t = 7)]
    fid: u64,

    /// Bytes written per round.
    #[arg(long, default_value_t = 1 << 20)]
    write_size: usize,

    /// Number of write-fsync-read rounds.
    #[arg(short, long, default_value_t = 1)]
    rounds: usize,

    /// Configuration string in TOML format.
    #[arg(long)]
    config: Option<String>,
}

impl CliArgs {
    fn sanitize(&self) -> Result<SocketAddr, StagefsError> {
        if self.write_size == 0 {
            return Err(StagefsError("invalid write_size 0".into()));
        }
        if self.rounds == 0 {
            return Err(StagefsError("invalid rounds 0".into()));
        }
        Ok(self.server.parse()?)
    }
}

/// One write-fsync-read round; returns an error when the read-back bytes
/// differ from what was written.
async fn run_round(
    client: &mut StagefsClient,
    fid: u64,
    offset: u64,
    write_size: usize,
) -> Result<(), StagefsError> {
    let tag = format!("round@{}", offset);

    let mut data = vec![0u8; write_size];
    rand::thread_rng().fill(&mut data[..]);
    client.pwrite(fid, offset, &data)?;
    client.set_attr(FileAttr {
        gfid: fid as i32,
        fid,
        filename: format!("/stage/ckpt-{}", fid),
        size: offset + write_size as u64,
        mode: 0o600,
        ..Default::default()
    });
    client.fsync().await?;

    let result = client
        .read(&[(fid, offset, write_size as u64)])
        .await?;
    if result.errcode != 0 {
        return Err(StagefsError(format!(
            "read errcode {}",
            result.errcode
        )));
    }
    if result.bytes_ok != write_size as u64 {
        return Err(StagefsError(format!(
            "short read: {} of {}",
            result.bytes_ok, write_size
        )));
    }

    // replies arrive in logical offset order and tile the request
    let mut cursor = offset;
    for reply in &result.replies {
        let start = (reply.offset - offset) as usize;
        if reply.data != data[start..start + reply.data.len()] {
            return Err(StagefsError(format!(
                "data mismatch at offset {}",
                reply.offset
            )));
        }
        cursor = reply.offset + reply.data.len() as u64;
    }
    if cursor != offset + write_size as u64 {
        return Err(StagefsError("replies do not tile the request".into()));
    }

    pf_info!(tag; "verified {} bytes in {} replies", write_size,
             result.replies.len());
    Ok(())
}

/// Client executable main entrance.
fn client_main() -> Result<(), StagefsError> {
    let args = CliArgs::parse();
    let server_addr = args.sanitize()?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name(format!("tokio-worker-client{}", args.client_id))
        .build()?;

    runtime.block_on(async move {
        let mut client = StagefsClient::new(
            args.app_id,
            args.client_id,
            args.client_id as i32,
            args.config.as_deref(),
        )?;
        client.mount(server_addr).await?;

        for round in 0..args.rounds {
            let offset = (round * args.write_size) as u64;
            run_round(&mut client, args.fid, offset, args.write_size)
                .await?;
        }

        client.unmount().await?;
        Ok::<(), StagefsError>(())
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = client_main() {
        pf_error!("client"; "client_main exited: {}", e);
    }
}

#[cfg(test)]
mod client_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), StagefsError> {
        let args = CliArgs {
            app_id: 1,
            client_id: 0,
            server: "127.0.0.1:47200".into(),
            fid: 7,
            write_size: 4096,
            rounds: 2,
            config: None,
        };
        assert!(args.sanitize().is_ok());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_write_size() {
        let args = CliArgs {
            app_id: 1,
            client_id: 0,
            server: "127.0.0.1:47200".into(),
            fid: 7,
            write_size: 0,
            rounds: 1,
            config: None,
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_server_addr() {
        let args = CliArgs {
            app_id: 1,
            client_id: 0,
            server: "not-an-addr".into(),
            fid: 7,
            write_size: 4096,
            rounds: 1,
            config: None,
        };
        assert!(args.sanitize().is_err());
    }
}
