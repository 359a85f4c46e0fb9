//! Two-peer static transfer: a seed and a leech over loopback UDP.

use std::time::Duration;

use riptide_core::swarm_id_hex;
use riptided::EngineCmd;

use crate::*;

#[tokio::test]
async fn seed_to_leech_full_file() {
    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();

    // 1017 chunks of 1024 bytes: a non-power-of-two, multi-peak swarm.
    let source = write_content(seed_dir.path(), "liveinput.dat", 1017 * 1024);

    let seeder = engine(seed_dir.path()).await.unwrap();
    let root = seeder.attach_file(source.clone()).await.unwrap();

    let leecher = engine(leech_dir.path()).await.unwrap();
    let url = format!(
        "tswift://127.0.0.1:{}/{}",
        seeder.udp_addr.port(),
        swarm_id_hex(&root)
    );
    leecher
        .cmd_tx
        .send(EngineCmd::Start {
            url,
            dest: Some(leech_dir.path().to_path_buf()),
            conn: 0,
        })
        .unwrap();

    let target = leech_dir.path().join(swarm_id_hex(&root));
    let expected = std::fs::read(&source).unwrap();
    wait_for(Duration::from_secs(20), || {
        std::fs::read(&target).map(|got| got == expected).unwrap_or(false)
    })
    .await
    .unwrap();

    seeder.shutdown();
    leecher.shutdown();
}

#[tokio::test]
async fn short_last_chunk_is_trimmed() {
    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();

    // Not a multiple of the chunk size: the exact length must survive.
    let source = write_content(seed_dir.path(), "odd.dat", 10 * 1024 + 137);

    let seeder = engine(seed_dir.path()).await.unwrap();
    let root = seeder.attach_file(source.clone()).await.unwrap();

    let leecher = engine(leech_dir.path()).await.unwrap();
    leecher
        .cmd_tx
        .send(EngineCmd::Start {
            url: format!(
                "tswift://127.0.0.1:{}/{}",
                seeder.udp_addr.port(),
                swarm_id_hex(&root)
            ),
            dest: Some(leech_dir.path().to_path_buf()),
            conn: 0,
        })
        .unwrap();

    let target = leech_dir.path().join(swarm_id_hex(&root));
    let expected = std::fs::read(&source).unwrap();
    wait_for(Duration::from_secs(20), || {
        std::fs::read(&target).map(|got| got == expected).unwrap_or(false)
    })
    .await
    .unwrap();

    assert_eq!(
        std::fs::metadata(&target).unwrap().len(),
        10 * 1024 + 137
    );
    seeder.shutdown();
    leecher.shutdown();
}

#[tokio::test]
async fn resume_from_checkpoint_seeds_without_rehash() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_content(dir.path(), "content.dat", 8 * 1024);

    // First engine hashes and checkpoints.
    let first = engine(dir.path()).await.unwrap();
    let root = first.attach_file(source.clone()).await.unwrap();
    first.shutdown();
    first.wait().await.unwrap();

    // Sidecars alone must be enough for a fresh engine to serve it.
    let (mhash, mbinmap) = riptide_store::sidecar::sidecar_paths(&source);
    assert!(mhash.exists());
    assert!(mbinmap.exists());
    let record = riptide_store::sidecar::read_mbinmap(&mbinmap).unwrap();
    assert_eq!(record.root, root);
    assert_eq!(record.complete_chunks, 8);
}
