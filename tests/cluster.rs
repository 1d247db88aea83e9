//! End-to-end tests driving delegators and clients through the full
//! write -> fsync -> read pipeline over localhost.

use std::net::SocketAddr;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use stagefs::{errcode, Delegator, StagefsClient, StagefsError};

/// Starts one delegator on the given ports and returns its run-loop task
/// plus the termination trigger.
async fn start_delegator(
    rank: u32,
    api_addr: SocketAddr,
    p2p_addrs: Vec<SocketAddr>,
    config: String,
) -> Result<
    (JoinHandle<Result<(), StagefsError>>, watch::Sender<bool>),
    StagefsError,
> {
    let mut delegator =
        Delegator::new_and_setup(rank, api_addr, p2p_addrs, Some(&config))
            .await?;
    let (tx_term, rx_term) = watch::channel(false);
    let handle =
        tokio::spawn(async move { delegator.run(rx_term).await });
    Ok((handle, tx_term))
}

fn test_config(tag: &str, range_size: u64) -> String {
    format!(
        "meta_db_path = '/tmp/stagefs-test-{}-{}/meta'\n\
         external_spill_dir = '/tmp/stagefs-test-{}-{}/spill'\n\
         meta_range_size = {}\n\
         meta_db_sanitize = true\n",
        tag,
        std::process::id(),
        tag,
        std::process::id(),
        range_size
    )
}

fn client_config(tag: &str) -> String {
    format!(
        "external_spill_dir = '/tmp/stagefs-test-{}-{}/spill'\n",
        tag,
        std::process::id()
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fsync_then_clipped_read() -> Result<(), StagefsError> {
    let api_addr: SocketAddr = "127.0.0.1:48200".parse()?;
    let p2p_addrs: Vec<SocketAddr> = vec!["127.0.0.1:48300".parse()?];
    let (server, tx_term) = start_delegator(
        0,
        api_addr,
        p2p_addrs,
        test_config("clip", 1 << 20),
    )
    .await?;

    let mut client =
        StagefsClient::new(11, 0, 0, Some(&client_config("clip")))?;
    client.mount(api_addr).await?;

    // three adjacent 64-byte writes stay three separate extents
    let chunk_a = vec![0xaau8; 64];
    let chunk_b = vec![0xbbu8; 64];
    let chunk_c = vec![0xccu8; 64];
    client.pwrite(7, 0, &chunk_a)?;
    client.pwrite(7, 64, &chunk_b)?;
    client.pwrite(7, 128, &chunk_c)?;
    client.fsync().await?;

    // a read clipped on both ends must span all three extents
    let result = client.read(&[(7, 32, 128)]).await?;
    assert_eq!(result.errcode, errcode::OK);
    assert_eq!(result.bytes_ok, 128);
    assert_eq!(result.replies.len(), 3);

    assert_eq!(result.replies[0].offset, 32);
    assert_eq!(result.replies[0].data, vec![0xaau8; 32]);
    assert_eq!(result.replies[1].offset, 64);
    assert_eq!(result.replies[1].data, vec![0xbbu8; 64]);
    assert_eq!(result.replies[2].offset, 128);
    assert_eq!(result.replies[2].data, vec![0xccu8; 32]);
    for reply in &result.replies {
        assert_eq!(reply.fid, 7);
        assert_eq!(reply.errcode, errcode::OK);
    }

    client.unmount().await?;
    tx_term.send(true).map_err(StagefsError::msg)?;
    server.await.map_err(StagefsError::msg)??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_read_of_partial_coverage() -> Result<(), StagefsError> {
    let api_addr: SocketAddr = "127.0.0.1:48210".parse()?;
    let p2p_addrs: Vec<SocketAddr> = vec!["127.0.0.1:48310".parse()?];
    let (server, tx_term) = start_delegator(
        0,
        api_addr,
        p2p_addrs,
        test_config("short", 1 << 20),
    )
    .await?;

    let mut client =
        StagefsClient::new(12, 0, 0, Some(&client_config("short")))?;
    client.mount(api_addr).await?;

    // the index covers only the first 2048 bytes of the request
    client.pwrite(9, 0, &vec![0x5au8; 2048])?;
    client.fsync().await?;

    let result = client.read(&[(9, 0, 4096)]).await?;
    assert_eq!(result.errcode, errcode::OK);
    assert_eq!(result.bytes_ok, 2048);
    assert_eq!(result.replies.len(), 1);
    assert_eq!(result.replies[0].offset, 0);
    assert_eq!(result.replies[0].data.len(), 2048);

    // a read of wholly unwritten space returns zero replies
    let result = client.read(&[(9, 1 << 30, 512)]).await?;
    assert_eq!(result.errcode, errcode::OK);
    assert_eq!(result.bytes_ok, 0);
    assert!(result.replies.is_empty());

    client.unmount().await?;
    tx_term.send(true).map_err(StagefsError::msg)?;
    server.await.map_err(StagefsError::msg)??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn cross_delegator_read() -> Result<(), StagefsError> {
    let api0: SocketAddr = "127.0.0.1:48220".parse()?;
    let api1: SocketAddr = "127.0.0.1:48221".parse()?;
    let p2p_addrs: Vec<SocketAddr> =
        vec!["127.0.0.1:48320".parse()?, "127.0.0.1:48321".parse()?];

    // a small slice width spreads one file's extents over both ranks
    let config = test_config("cross", 4096);
    let (server0, server1) = tokio::join!(
        start_delegator(0, api0, p2p_addrs.clone(), config.clone()),
        start_delegator(1, api1, p2p_addrs.clone(), config.clone()),
    );
    let (server0, tx_term0) = server0?;
    let (server1, tx_term1) = server1?;

    // two clients of the same app, one per delegator, each contributing
    // half of the same file
    let mut client0 =
        StagefsClient::new(13, 0, 0, Some(&client_config("cross")))?;
    let mut client1 =
        StagefsClient::new(13, 1, 1, Some(&client_config("cross")))?;
    client0.mount(api0).await?;
    client1.mount(api1).await?;

    let half0: Vec<u8> = (0..16384u32).map(|i| i as u8).collect();
    let half1: Vec<u8> = (0..16384u32).map(|i| (i as u8) ^ 0xff).collect();
    client0.pwrite(3, 0, &half0)?;
    client1.pwrite(3, 16384, &half1)?;
    client0.fsync().await?;
    client1.fsync().await?;

    // client0 reads the whole file; half of it lives on delegator 1
    let result = client0.read(&[(3, 0, 32768)]).await?;
    assert_eq!(result.errcode, errcode::OK);
    assert_eq!(result.bytes_ok, 32768);

    let mut assembled = vec![0u8; 32768];
    for reply in &result.replies {
        assert_eq!(reply.errcode, errcode::OK);
        let start = reply.offset as usize;
        assembled[start..start + reply.data.len()]
            .copy_from_slice(&reply.data);
    }
    assert_eq!(&assembled[..16384], &half0[..]);
    assert_eq!(&assembled[16384..], &half1[..]);

    // the attribute index is visible from either delegator
    client1.set_attr(stagefs::FileAttr {
        gfid: 33,
        fid: 3,
        filename: "/stage/shared.ckpt".into(),
        size: 32768,
        ..Default::default()
    });
    client1.fsync().await?;
    let attr = client0.get_attr(33).await?;
    assert_eq!(attr.unwrap().size, 32768);
    assert_eq!(client0.get_attr(404).await?, None);

    client0.unmount().await?;
    client1.unmount().await?;
    tx_term0.send(true).map_err(StagefsError::msg)?;
    tx_term1.send(true).map_err(StagefsError::msg)?;
    server0.await.map_err(StagefsError::msg)??;
    server1.await.map_err(StagefsError::msg)??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spilled_data_read_back() -> Result<(), StagefsError> {
    let api_addr: SocketAddr = "127.0.0.1:48230".parse()?;
    let p2p_addrs: Vec<SocketAddr> = vec!["127.0.0.1:48330".parse()?];
    let (server, tx_term) = start_delegator(
        0,
        api_addr,
        p2p_addrs,
        test_config("spill", 1 << 20),
    )
    .await?;

    // a tiny in-memory log forces the second write into the spill file
    let config = format!(
        "{}data_size = 65536\n",
        client_config("spill")
    );
    let mut client = StagefsClient::new(14, 0, 0, Some(&config))?;
    client.mount(api_addr).await?;

    let in_mem = vec![0x11u8; 60000];
    let spilled = vec![0x22u8; 50000];
    client.pwrite(5, 0, &in_mem)?;
    client.pwrite(5, 60000, &spilled)?;
    client.fsync().await?;

    let result = client.read(&[(5, 0, 110000)]).await?;
    assert_eq!(result.errcode, errcode::OK);
    assert_eq!(result.bytes_ok, 110000);

    let mut assembled = vec![0u8; 110000];
    for reply in &result.replies {
        let start = reply.offset as usize;
        assembled[start..start + reply.data.len()]
            .copy_from_slice(&reply.data);
    }
    assert_eq!(&assembled[..60000], &in_mem[..]);
    assert_eq!(&assembled[60000..], &spilled[..]);

    client.unmount().await?;
    tx_term.send(true).map_err(StagefsError::msg)?;
    server.await.map_err(StagefsError::msg)??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overwrite_shadows_earlier_fsync() -> Result<(), StagefsError> {
    let api_addr: SocketAddr = "127.0.0.1:48240".parse()?;
    let p2p_addrs: Vec<SocketAddr> = vec!["127.0.0.1:48340".parse()?];
    let (server, tx_term) = start_delegator(
        0,
        api_addr,
        p2p_addrs,
        test_config("shadow", 1 << 20),
    )
    .await?;

    let mut client =
        StagefsClient::new(15, 0, 0, Some(&client_config("shadow")))?;
    client.mount(api_addr).await?;

    client.pwrite(2, 0, &vec![0x01u8; 4096])?;
    client.fsync().await?;

    // the second fsync's extents shadow the first's
    client.pwrite(2, 1024, &vec![0x02u8; 1024])?;
    client.fsync().await?;

    let result = client.read(&[(2, 0, 4096)]).await?;
    assert_eq!(result.errcode, errcode::OK);
    assert_eq!(result.bytes_ok, 4096);

    let mut assembled = vec![0u8; 4096];
    for reply in &result.replies {
        let start = reply.offset as usize;
        assembled[start..start + reply.data.len()]
            .copy_from_slice(&reply.data);
    }
    assert!(assembled[..1024].iter().all(|&b| b == 0x01));
    assert!(assembled[1024..2048].iter().all(|&b| b == 0x02));
    assert!(assembled[2048..].iter().all(|&b| b == 0x01));

    client.unmount().await?;
    tx_term.send(true).map_err(StagefsError::msg)?;
    server.await.map_err(StagefsError::msg)??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clean_shutdown_with_mounted_client() -> Result<(), StagefsError> {
    let api_addr: SocketAddr = "127.0.0.1:48250".parse()?;
    let p2p_addrs: Vec<SocketAddr> = vec!["127.0.0.1:48350".parse()?];
    let (server, tx_term) = start_delegator(
        0,
        api_addr,
        p2p_addrs,
        test_config("down", 1 << 20),
    )
    .await?;

    let mut client =
        StagefsClient::new(16, 0, 0, Some(&client_config("down")))?;
    client.mount(api_addr).await?;
    client.pwrite(1, 0, &vec![0x77u8; 512])?;
    client.fsync().await?;
    // one read so the request manager thread exists and gets joined
    let result = client.read(&[(1, 0, 512)]).await?;
    assert_eq!(result.bytes_ok, 512);

    // terminate without unmounting; the delegator must come down clean
    tx_term.send(true).map_err(StagefsError::msg)?;
    server.await.map_err(StagefsError::msg)??;
    Ok(())
}
