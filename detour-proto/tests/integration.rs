//! End-to-end exercise of the codec and wire framing over a real socket
//! pair, without any client/server process wiring.
use detour_proto::obfuscation::SwapsPool;
use detour_proto::transport::{recv_multipart, send_multipart};
use detour_proto::wire::{RelayData, RelayMethod, RelayRequest, RelayResponse};
use tokio::net::TcpListener;

#[tokio::test]
async fn connect_then_data_then_close_round_trips_over_loopback() {
    let pool = SwapsPool::new("integration-token");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let frames = recv_multipart(&mut stream).await.unwrap();
        let request = RelayRequest::deobfuscate(frames).unwrap();
        assert_eq!(request.method, RelayMethod::Connect);
        assert_eq!(request.addr.as_deref(), Some("example.com"));
        assert_eq!(request.port, Some(443));

        let response = RelayResponse::ok(
            RelayMethod::Connect,
            "tcp://127.0.0.1:50000",
            "127.0.0.1".to_string(),
            50000,
        );
        send_multipart(&mut stream, &response.obfuscate(&pool)).await.unwrap();

        let frames = recv_multipart(&mut stream).await.unwrap();
        let data = RelayData::deobfuscate(frames).unwrap();
        assert!(data.eos);
        assert_eq!(data.data, b"GET / HTTP/1.1\r\n\r\n");

        let frames = recv_multipart(&mut stream).await.unwrap();
        let close = RelayData::deobfuscate(frames).unwrap();
        assert_eq!(close.method, RelayMethod::Close);
    });

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();

    let request = RelayRequest::connect("example.com", 443);
    send_multipart(&mut client, &request.obfuscate(&pool)).await.unwrap();

    let frames = recv_multipart(&mut client).await.unwrap();
    let response = RelayResponse::deobfuscate(frames).unwrap();
    assert!(response.ok);
    assert_eq!(response.connection, "tcp://127.0.0.1:50000");

    let fragment = RelayData::fragment(b"GET / HTTP/1.1\r\n\r\n".to_vec(), true);
    send_multipart(&mut client, &fragment.obfuscate(&pool)).await.unwrap();

    send_multipart(&mut client, &RelayData::close().obfuscate(&pool)).await.unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn malformed_header_is_rejected_without_panicking() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let frames = recv_multipart(&mut stream).await.unwrap();
        assert!(RelayRequest::deobfuscate(frames).is_err());
    });

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    let bogus = detour_proto::wire::Frames::from_parts(b"not json".to_vec(), Vec::new(), Vec::new());
    send_multipart(&mut client, &bogus).await.unwrap();

    server.await.unwrap();
}
