//! Command-channel behavior: START/PLAY/INFO, REMOVE cleanup, and the
//! ERROR path for malformed commands.

use std::time::Duration;

use riptide_core::swarm_id_hex;

use crate::*;

#[tokio::test]
async fn start_reports_info_and_play() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_content(dir.path(), "seedme.dat", 4 * 1024);

    let engine = engine_with_gateways(dir.path()).await.unwrap();
    let root = engine.attach_file(source).await.unwrap();

    let mut cmd = CmdClient::connect(engine.cmd_addr.unwrap()).await.unwrap();
    // Trackerless single-slash form: the swarm is already local.
    cmd.send_line(&format!(
        "START tswift:/{} {}",
        swarm_id_hex(&root),
        dir.path().display()
    ))
    .await
    .unwrap();

    let info = cmd
        .wait_line_with("INFO", Duration::from_secs(5))
        .await
        .unwrap();
    let words: Vec<&str> = info.split(' ').collect();
    assert_eq!(words[1], swarm_id_hex(&root));
    // An attached complete swarm reports SEEDING (4).
    assert_eq!(words[2], "4");

    let play = cmd
        .wait_line_with("PLAY", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(play.contains(&swarm_id_hex(&root)));
    assert!(play.contains("http://"));
    engine.shutdown();
}

#[tokio::test]
async fn remove_deletes_content_and_state() {
    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();
    let source = write_content(seed_dir.path(), "gone.dat", 6 * 1024);

    let seeder = engine(seed_dir.path()).await.unwrap();
    let root = seeder.attach_file(source).await.unwrap();

    let leecher = engine_with_gateways(leech_dir.path()).await.unwrap();
    let mut cmd = CmdClient::connect(leecher.cmd_addr.unwrap()).await.unwrap();
    cmd.send_line(&format!(
        "START tswift://127.0.0.1:{}/{} {}",
        seeder.udp_addr.port(),
        swarm_id_hex(&root),
        leech_dir.path().display()
    ))
    .await
    .unwrap();

    let content_file = leech_dir.path().join(swarm_id_hex(&root));
    let expected = content(6 * 1024);
    wait_for(Duration::from_secs(20), || {
        std::fs::read(&content_file).map(|d| d == expected).unwrap_or(false)
    })
    .await
    .unwrap();

    // Checkpoint so both sidecars exist, then remove everything.
    cmd.send_line(&format!("CHECKPOINT {}", swarm_id_hex(&root)))
        .await
        .unwrap();
    let mbinmap = leech_dir
        .path()
        .join(format!("{}.mbinmap", swarm_id_hex(&root)));
    wait_for(Duration::from_secs(5), || mbinmap.exists())
        .await
        .unwrap();

    cmd.send_line(&format!("REMOVE {} 1 1", swarm_id_hex(&root)))
        .await
        .unwrap();
    wait_for(Duration::from_secs(5), || {
        !content_file.exists() && !mbinmap.exists()
    })
    .await
    .unwrap();
    let mhash = leech_dir
        .path()
        .join(format!("{}.mhash", swarm_id_hex(&root)));
    assert!(!mhash.exists());

    seeder.shutdown();
    leecher.shutdown();
}

#[tokio::test]
async fn malformed_start_yields_error_and_close() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_gateways(dir.path()).await.unwrap();
    let mut cmd = CmdClient::connect(engine.cmd_addr.unwrap()).await.unwrap();

    cmd.send_line(&format!("START tswift:/BADURL{} {}", "ab".repeat(20), dir.path().display()))
        .await
        .unwrap();
    let line = cmd
        .wait_line_with("ERROR", Duration::from_secs(5))
        .await
        .unwrap();
    let words: Vec<&str> = line.split(' ').collect();
    assert_eq!(words[1], "0".repeat(40));

    // The gateway closes the connection after a command error.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cmd.read_line(Duration::from_secs(5)).await.is_err() {
                return true;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed);
    engine.shutdown();
}

#[tokio::test]
async fn unknown_command_yields_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_gateways(dir.path()).await.unwrap();
    let mut cmd = CmdClient::connect(engine.cmd_addr.unwrap()).await.unwrap();

    cmd.send_line("FROBNICATE now").await.unwrap();
    let line = cmd
        .wait_line_with("ERROR", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(line.starts_with(&format!("ERROR {}", "0".repeat(40))));
    engine.shutdown();
}

#[tokio::test]
async fn maxspeed_limits_are_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_content(dir.path(), "limited.dat", 4 * 1024);
    let engine = engine_with_gateways(dir.path()).await.unwrap();
    let root = engine.attach_file(source).await.unwrap();

    let mut cmd = CmdClient::connect(engine.cmd_addr.unwrap()).await.unwrap();
    cmd.send_line(&format!(
        "MAXSPEED {} UPLOAD 10.0",
        swarm_id_hex(&root)
    ))
    .await
    .unwrap();
    // The command must not error out; INFO keeps flowing.
    let line = cmd
        .wait_line_with("INFO", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(line.contains(&swarm_id_hex(&root)));
    engine.shutdown();
}
