//! Multi-file VOD: spec + files downloaded over the control channel, then
//! a checkpoint whose .mbinmap matches the text schema.

use std::time::Duration;

use riptide_core::swarm_id_hex;

use crate::*;

fn build_collection(dir: &std::path::Path) -> u64 {
    let sub = dir.join("MyCollection");
    std::fs::create_dir_all(&sub).unwrap();
    // Constant-byte files like the reference fixtures.
    std::fs::write(sub.join("anita.ts"), vec![b'a'; 1234]).unwrap();
    std::fs::write(sub.join("harry.ts"), vec![b'h'; 5000]).unwrap();
    std::fs::write(sub.join("sjaak.ts"), vec![b's'; 24567]).unwrap();
    1234 + 5000 + 24567
}

#[tokio::test]
async fn vod_multifile_all() {
    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();
    let input_total = build_collection(seed_dir.path());

    let seeder = engine(seed_dir.path()).await.unwrap();
    let root = seeder
        .attach_multi(seed_dir.path().to_path_buf())
        .await
        .unwrap();

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

    // INFO converges on seqcomp == dynasize > input bytes (the spec
    // document rides in front of the files).
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let left = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("download did not complete in time");
        let line = cmd.wait_line_with("INFO", left).await.unwrap();
        let words: Vec<&str> = line.split(' ').collect();
        assert_eq!(words[1], swarm_id_hex(&root));
        let progress: Vec<u64> = words[3]
            .split('/')
            .map(|n| n.parse().unwrap())
            .collect();
        let (seqcomp, dynasize) = (progress[0], progress[1]);
        if seqcomp > 0 && seqcomp == dynasize && dynasize > input_total {
            break;
        }
    }

    // Sub-files on disk equal the source.
    for name in ["anita.ts", "harry.ts", "sjaak.ts"] {
        let want = std::fs::read(seed_dir.path().join("MyCollection").join(name)).unwrap();
        let got = std::fs::read(leech_dir.path().join("MyCollection").join(name)).unwrap();
        assert_eq!(want, got, "{name} differs after download");
    }

    // CHECKPOINT then inspect the .mbinmap schema.
    cmd.send_line(&format!("CHECKPOINT {}", swarm_id_hex(&root)))
        .await
        .unwrap();
    let mbinmap = leech_dir
        .path()
        .join(format!("{}.mbinmap", swarm_id_hex(&root)));
    wait_for(Duration::from_secs(5), || mbinmap.exists())
        .await
        .unwrap();

    let text = std::fs::read_to_string(&mbinmap).unwrap();
    let mut complete = 0u64;
    let mut completec = 0u64;
    for line in text.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["version", v] => assert_eq!(*v, "1"),
            ["root", "hash", h] => assert_eq!(*h, swarm_id_hex(&root)),
            ["chunk", "size", n] => assert_eq!(*n, "1024"),
            ["complete", n] => complete = n.parse().unwrap(),
            ["completec", n] => completec = n.parse().unwrap(),
            _ => {}
        }
    }
    assert!(complete >= input_total);
    assert!(completec >= input_total / 1024);

    seeder.shutdown();
    leecher.shutdown();
}

#[tokio::test]
async fn setmoreinfo_reports_channels() {
    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();
    build_collection(seed_dir.path());

    let seeder = engine(seed_dir.path()).await.unwrap();
    let root = seeder
        .attach_multi(seed_dir.path().to_path_buf())
        .await
        .unwrap();

    let leecher = engine_with_gateways(leech_dir.path()).await.unwrap();
    let mut cmd = CmdClient::connect(leecher.cmd_addr.unwrap()).await.unwrap();
    cmd.send(
        format!(
            "START tswift://127.0.0.1:{}/{} {}\r\nSETMOREINFO {} 1\r\n",
            seeder.udp_addr.port(),
            swarm_id_hex(&root),
            leech_dir.path().display(),
            swarm_id_hex(&root),
        )
        .as_bytes(),
    )
    .await
    .unwrap();

    let mut got_info = false;
    let mut got_play = false;
    let mut got_moreinfo = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !(got_info && got_play && got_moreinfo) {
        let left = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("missing INFO/PLAY/MOREINFO");
        let line = cmd.read_line(left).await.unwrap();
        if line.starts_with("INFO ") {
            got_info = true;
        } else if line.starts_with("PLAY ") {
            got_play = true;
        } else if line.starts_with("MOREINFO ") {
            let json_start = "MOREINFO ".len() + 40 + 1;
            let parsed: serde_json::Value =
                serde_json::from_str(&line[json_start..]).unwrap();
            let channels = parsed["channels"].as_array().unwrap();
            if !channels.is_empty() {
                assert_eq!(channels[0]["ip"], "127.0.0.1");
                assert_eq!(
                    channels[0]["port"].as_u64().unwrap(),
                    u64::from(seeder.udp_addr.port())
                );
                got_moreinfo = true;
            }
        }
    }
    seeder.shutdown();
    leecher.shutdown();
}
