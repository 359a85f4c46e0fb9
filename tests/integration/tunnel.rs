//! Tunneling between the control channel and the swarm UDP socket, under
//! deliberately hostile TCP fragmentation.

use std::time::Duration;

use tokio::net::UdpSocket;

use crate::*;

async fn recv_udp(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 65536];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for tunnel datagram")
        .unwrap();
    buf.truncate(len);
    buf
}

fn tunnel_cmd(port: u16, size: usize) -> String {
    format!("TUNNELSEND 127.0.0.1:{port}/ffffffff {size}\r\n")
}

#[tokio::test]
async fn tunnel_send_variants() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_gateways(dir.path()).await.unwrap();
    let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut cmd = CmdClient::connect(engine.cmd_addr.unwrap()).await.unwrap();

    // Command and payload in one write.
    let payload = content(977);
    let mut wire = tunnel_cmd(port, payload.len()).into_bytes();
    wire.extend_from_slice(&payload);
    cmd.send(&wire).await.unwrap();
    let got = recv_udp(&listener).await;
    assert_eq!(&got[..4], &[0xff, 0xff, 0xff, 0xff]);
    assert_eq!(&got[4..], &payload[..]);

    // Command separated from payload.
    let payload = content(512);
    cmd.send(tunnel_cmd(port, payload.len()).as_bytes())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    cmd.send(&payload).await.unwrap();
    let got = recv_udp(&listener).await;
    assert_eq!(&got[4..], &payload[..]);

    // Another command packed right behind the payload.
    let payload = content(64);
    let mut wire = tunnel_cmd(port, payload.len()).into_bytes();
    wire.extend_from_slice(&payload);
    wire.extend_from_slice(
        b"SETMOREINFO 979152e57a82d8781eb1f2cd0c4ab8777e431012 1\r\n",
    );
    cmd.send(&wire).await.unwrap();
    let got = recv_udp(&listener).await;
    assert_eq!(&got[4..], &payload[..]);

    // Payload split mid-way.
    let payload = content(1400);
    cmd.send(tunnel_cmd(port, payload.len()).as_bytes())
        .await
        .unwrap();
    cmd.send(&payload[..700]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    cmd.send(&payload[700..]).await.unwrap();
    let got = recv_udp(&listener).await;
    assert_eq!(&got[4..], &payload[..]);

    engine.shutdown();
}

#[tokio::test]
async fn tunnel_recv_surfaces_on_control() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_gateways(dir.path()).await.unwrap();
    let mut cmd = CmdClient::connect(engine.cmd_addr.unwrap()).await.unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    for len in [1usize, 333, 2048] {
        let payload = content(len);
        let mut dgram = vec![0xff, 0xff, 0xff, 0xff];
        dgram.extend_from_slice(&payload);
        sender.send_to(&dgram, engine.udp_addr).await.unwrap();

        let line = cmd
            .wait_line_with("TUNNELRECV", Duration::from_secs(5))
            .await
            .unwrap();
        let words: Vec<&str> = line.split(' ').collect();
        assert!(words[1].ends_with("/ffffffff"), "source tag in {line:?}");
        let size: usize = words[2].parse().unwrap();
        assert_eq!(size, len);
        let got = cmd.read_exact(size, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got, payload);
    }
    engine.shutdown();
}
