//! TCP receiver integration tests: framing across chunked writes.

use cinder_lib::core::Points;
use cinder_lib::receiver::TcpReceiver;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct TcpTestCase {
    receiver: TcpReceiver,
    stream: TcpStream,
    rx: mpsc::Receiver<Points>,
}

async fn new_tcp_test_case() -> TcpTestCase {
    let (tx, rx) = mpsc::channel(128);
    let receiver = TcpReceiver::new(tx);

    let mut settings = receiver.settings().await;
    settings.listen_addr = "127.0.0.1:0".to_string();
    settings.enabled = true;
    receiver.apply(settings).await.expect("bind tcp receiver");

    let addr = receiver.local_addr().await.expect("bound address");
    let stream = TcpStream::connect(addr).await.expect("connect");

    TcpTestCase {
        receiver,
        stream,
        rx,
    }
}

impl TcpTestCase {
    async fn send(&mut self, text: &str) {
        self.stream.write_all(text.as_bytes()).await.expect("write");
        self.stream.flush().await.expect("flush");
    }

    async fn expect_points(&mut self, expected: Points) {
        let got = timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("timed out waiting for points")
            .expect("points channel closed");
        assert_eq!(got, expected);
    }

    async fn finish(self) {
        self.receiver.stop().await.expect("stop receiver");
    }
}

#[tokio::test]
async fn test_chunked_stream_carries_partial_line_over() {
    let mut test = new_tcp_test_case().await;

    test.send("hello.world 42.15 1422698155\nmetri").await;
    test.expect_points(Points::one_point("hello.world", 42.15, 1422698155))
        .await;

    test.send("c.name -72.11 1422698155\n").await;
    test.expect_points(Points::one_point("metric.name", -72.11, 1422698155))
        .await;

    test.finish().await;
}

#[tokio::test]
async fn test_malformed_line_keeps_connection_alive() {
    let mut test = new_tcp_test_case().await;

    test.send("not a valid line at all\n").await;
    test.send("ok.metric 1 1422698155\n").await;
    test.expect_points(Points::one_point("ok.metric", 1.0, 1422698155))
        .await;
    assert_eq!(test.receiver.stats().snapshot().errors, 1);

    test.finish().await;
}

#[tokio::test]
async fn test_unfinished_line_at_eof_is_dropped() {
    let mut test = new_tcp_test_case().await;

    test.send("complete.metric 1 1422698155\nincomplete 2 14226").await;
    test.expect_points(Points::one_point("complete.metric", 1.0, 1422698155))
        .await;

    // Closing the connection leaves the fragment undelivered.
    drop(test.stream);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        if test.receiver.stats().snapshot().incomplete == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "fragment was not discarded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(test.rx.try_recv().is_err());

    test.receiver.stop().await.expect("stop receiver");
}

#[tokio::test]
async fn test_stop_closes_open_connections() {
    let test = new_tcp_test_case().await;

    // stop() must return even with a live, idle connection.
    timeout(Duration::from_secs(2), test.receiver.stop())
        .await
        .expect("stop timed out with an open connection")
        .expect("stop receiver");
    assert!(test.receiver.local_addr().await.is_none());
}

#[tokio::test]
async fn test_carriage_return_accepted() {
    let mut test = new_tcp_test_case().await;

    test.send("win.metric 5 1422698155\r\n").await;
    test.expect_points(Points::one_point("win.metric", 5.0, 1422698155))
        .await;

    test.finish().await;
}
