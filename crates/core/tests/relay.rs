//! Relay scenarios over real TCP connections.
//!
//! Every test runs its own relay on a fixed loopback port and talks to it
//! with minimal RTSP clients: publishers ANNOUNCE/SETUP/RECORD and push
//! interleaved RTP, subscribers DESCRIBE/SETUP/PLAY and read it back.

use std::io::{BufReader, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use relay::media::RtpPacket;
use relay::protocol::codec::{Message, read_message};
use relay::protocol::{RtspRequest, RtspResponse};
use relay::transport::interleaved::encode_frame;
use relay::{PublishPolicy, PublishState, RelayConfig, RelayServer, RtspError};

const SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Camera\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1\r\n\
a=control:streamid=0\r\n";

const AV_SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Camera\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1\r\n\
a=control:streamid=0\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=rtpmap:97 MPEG4-GENERIC/48000/2\r\n\
a=control:streamid=1\r\n";

struct Client {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    cseq: u32,
    session: Option<String>,
}

impl Client {
    /// Connect, retrying while the relay thread is still binding.
    fn connect(port: u16) -> Client {
        let deadline = Instant::now() + Duration::from_secs(5);
        let stream = loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() > deadline => panic!("relay not listening: {e}"),
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        };
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Client {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
            cseq: 0,
            session: None,
        }
    }

    fn request(
        &mut self,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: Option<&str>,
    ) -> RtspResponse {
        self.cseq += 1;
        let mut request = RtspRequest::new(method, uri).add_header("CSeq", &self.cseq.to_string());
        if let Some(session) = &self.session {
            request = request.add_header("Session", session);
        }
        for (name, value) in headers {
            request = request.add_header(name, value);
        }
        if let Some(body) = body {
            request = request.with_body(body.to_string());
        }
        self.writer
            .write_all(request.serialize().as_bytes())
            .unwrap();

        loop {
            match read_message(&mut self.reader).unwrap() {
                Some(Message::Response(response)) => {
                    assert_eq!(response.get_header("CSeq"), Some(self.cseq.to_string().as_str()));
                    if let Some(session) = response.get_header("Session") {
                        self.session = session.split(';').next().map(str::to_string);
                    }
                    return response;
                }
                Some(_) => continue,
                None => panic!("connection closed while waiting for {method} response"),
            }
        }
    }

    fn publish(&mut self, port: u16) {
        let uri = format!("rtsp://127.0.0.1:{port}/live");
        let announce = self.request(
            "ANNOUNCE",
            &uri,
            &[("Content-Type", "application/sdp")],
            Some(SDP),
        );
        assert_eq!(announce.status_code, 200);

        let setup = self.request(
            "SETUP",
            &format!("{uri}/streamid=0"),
            &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record")],
            None,
        );
        assert_eq!(setup.status_code, 200);

        let record = self.request("RECORD", &uri, &[("Range", "npt=0.000-")], None);
        assert_eq!(record.status_code, 200);
    }

    fn subscribe(&mut self, port: u16) {
        let uri = format!("rtsp://127.0.0.1:{port}/live");
        let describe = self.request("DESCRIBE", &uri, &[("Accept", "application/sdp")], None);
        assert_eq!(describe.status_code, 200);
        let base = describe.get_header("Content-Base").unwrap().to_string();

        let setup = self.request(
            "SETUP",
            &format!("{base}trackID=0"),
            &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
            None,
        );
        assert_eq!(setup.status_code, 200);

        let play = self.request("PLAY", &uri, &[], None);
        assert_eq!(play.status_code, 200);
    }

    fn send_rtp(&mut self, packet: &RtpPacket) {
        self.send_rtp_on(0, packet);
    }

    fn send_rtp_on(&mut self, channel: u8, packet: &RtpPacket) {
        let frame = encode_frame(channel, &packet.marshal()).unwrap();
        self.writer.write_all(&frame).unwrap();
    }

    /// Next interleaved frame on any channel.
    fn read_frame(&mut self) -> (u8, RtpPacket) {
        loop {
            match read_message(&mut self.reader).unwrap() {
                Some(Message::Interleaved { channel, payload }) => {
                    return (channel, RtpPacket::parse(&payload).unwrap());
                }
                Some(_) => continue,
                None => panic!("connection closed while waiting for RTP"),
            }
        }
    }

    fn read_rtp(&mut self) -> RtpPacket {
        loop {
            match read_message(&mut self.reader).unwrap() {
                Some(Message::Interleaved { channel: 0, payload }) => {
                    return RtpPacket::parse(&payload).unwrap();
                }
                Some(_) => continue,
                None => panic!("connection closed while waiting for RTP"),
            }
        }
    }

    /// Whether the relay closed this connection.
    fn is_disconnected(&mut self) -> bool {
        matches!(read_message(&mut self.reader), Ok(None) | Err(_))
    }
}

fn start(port: u16, config: RelayConfig) -> (RelayServer, thread::JoinHandle<relay::Result<()>>) {
    let server = RelayServer::with_config(port, config).unwrap();
    let runner = {
        let server = server.clone();
        thread::spawn(move || server.run())
    };
    (server, runner)
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn video_packet(seq: u16) -> RtpPacket {
    RtpPacket::new(96, seq, u32::from(seq) * 3000, 0x1234, true, vec![0x65, seq as u8])
}

#[test]
fn describe_is_404_until_published() {
    let port = 18554;
    let (server, runner) = start(port, RelayConfig::default());
    let uri = format!("rtsp://127.0.0.1:{port}/live");

    let mut subscriber = Client::connect(port);
    let response = subscriber.request("DESCRIBE", &uri, &[], None);
    assert_eq!(response.status_code, 404);
    let response = subscriber.request(
        "SETUP",
        &format!("{uri}/trackID=0"),
        &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
        None,
    );
    assert_eq!(response.status_code, 404);

    let mut publisher = Client::connect(port);
    publisher.publish(port);
    assert_eq!(server.status(), PublishState::Recording);

    let response = subscriber.request("DESCRIBE", &uri, &[], None);
    assert_eq!(response.status_code, 200);
    assert_eq!(response.get_header("Content-Type"), Some("application/sdp"));
    let body = response.body.unwrap();
    assert!(body.contains("a=rtpmap:96 H264/90000"));
    assert!(body.contains("a=control:trackID=0"));

    server.close();
    runner.join().unwrap().unwrap();
}

#[test]
fn subscribers_receive_every_packet_in_order() {
    let port = 18555;
    let (server, runner) = start(port, RelayConfig::default());

    let mut publisher = Client::connect(port);
    publisher.publish(port);

    let mut first = Client::connect(port);
    let mut second = Client::connect(port);
    first.subscribe(port);
    second.subscribe(port);
    assert_eq!(server.subscriber_count(), 2);

    for seq in 0..50 {
        publisher.send_rtp(&video_packet(seq));
    }

    for subscriber in [&mut first, &mut second] {
        for seq in 0..50 {
            let packet = subscriber.read_rtp();
            assert_eq!(packet.sequence_number, seq);
            assert_eq!(&packet.payload[..], &[0x65, seq as u8]);
        }
    }

    server.close();
    runner.join().unwrap().unwrap();
}

#[test]
fn every_media_is_relayed_on_its_own_channel() {
    let port = 18561;
    let (server, runner) = start(port, RelayConfig::default());
    let uri = format!("rtsp://127.0.0.1:{port}/live");

    let mut publisher = Client::connect(port);
    let announce = publisher.request(
        "ANNOUNCE",
        &uri,
        &[("Content-Type", "application/sdp")],
        Some(AV_SDP),
    );
    assert_eq!(announce.status_code, 200);
    for (track, interleaved) in [(0, "0-1"), (1, "2-3")] {
        let transport = format!("RTP/AVP/TCP;unicast;interleaved={interleaved};mode=record");
        let setup = publisher.request(
            "SETUP",
            &format!("{uri}/streamid={track}"),
            &[("Transport", transport.as_str())],
            None,
        );
        assert_eq!(setup.status_code, 200);
    }
    assert_eq!(publisher.request("RECORD", &uri, &[], None).status_code, 200);

    let mut subscriber = Client::connect(port);
    let describe = subscriber.request("DESCRIBE", &uri, &[], None);
    assert_eq!(describe.status_code, 200);
    let body = describe.body.clone().unwrap();
    assert!(body.contains("a=control:trackID=0"));
    assert!(body.contains("a=control:trackID=1"));
    let base = describe.get_header("Content-Base").unwrap().to_string();
    for (track, interleaved) in [(0, "0-1"), (1, "2-3")] {
        let transport = format!("RTP/AVP/TCP;unicast;interleaved={interleaved}");
        let setup = subscriber.request(
            "SETUP",
            &format!("{base}trackID={track}"),
            &[("Transport", transport.as_str())],
            None,
        );
        assert_eq!(setup.status_code, 200);
    }
    assert_eq!(subscriber.request("PLAY", &uri, &[], None).status_code, 200);

    let audio = RtpPacket::new(97, 77, 1024, 0x5678, true, vec![0x21, 0x10]);
    publisher.send_rtp_on(2, &audio);
    publisher.send_rtp_on(0, &video_packet(9));

    let mut received = vec![subscriber.read_frame(), subscriber.read_frame()];
    received.sort_by_key(|(channel, _)| *channel);
    let received: Vec<_> = received
        .iter()
        .map(|(channel, packet)| (*channel, packet.payload_type, packet.sequence_number))
        .collect();
    assert_eq!(received, vec![(0, 96, 9), (2, 97, 77)]);

    server.close();
    runner.join().unwrap().unwrap();
}

#[test]
fn new_publisher_evicts_previous_one() {
    let port = 18556;
    let (server, runner) = start(port, RelayConfig::default());
    let uri = format!("rtsp://127.0.0.1:{port}/live");

    let mut old_publisher = Client::connect(port);
    old_publisher.publish(port);
    let mut old_subscriber = Client::connect(port);
    old_subscriber.subscribe(port);

    let mut new_publisher = Client::connect(port);
    new_publisher.publish(port);

    assert!(old_publisher.is_disconnected());
    assert!(old_subscriber.is_disconnected());
    assert!(server.has_stream());
    assert_eq!(server.status(), PublishState::Recording);

    // the new stream is served and relays the new publisher
    let mut subscriber = Client::connect(port);
    subscriber.subscribe(port);
    new_publisher.send_rtp(&video_packet(7));
    assert_eq!(subscriber.read_rtp().sequence_number, 7);

    let response = Client::connect(port).request("DESCRIBE", &uri, &[], None);
    assert_eq!(response.status_code, 200);

    server.close();
    runner.join().unwrap().unwrap();
}

#[test]
fn publisher_disconnect_clears_stream() {
    let port = 18557;
    let (server, runner) = start(port, RelayConfig::default());
    let uri = format!("rtsp://127.0.0.1:{port}/live");

    let mut publisher = Client::connect(port);
    publisher.publish(port);
    let mut subscriber = Client::connect(port);
    subscriber.subscribe(port);

    // a subscriber leaving does not touch the stream
    let response = subscriber.request("TEARDOWN", &uri, &[], None);
    assert_eq!(response.status_code, 200);
    assert!(server.has_stream());

    drop(publisher);
    wait_until("stream teardown", || !server.has_stream());
    assert_eq!(server.status(), PublishState::Waiting);

    let response = Client::connect(port).request("DESCRIBE", &uri, &[], None);
    assert_eq!(response.status_code, 404);

    server.close();
    runner.join().unwrap().unwrap();
}

#[test]
fn reject_policy_keeps_first_publisher() {
    let port = 18558;
    let config = RelayConfig {
        publish_policy: PublishPolicy::RejectWhileActive,
        ..Default::default()
    };
    let (server, runner) = start(port, config);
    let uri = format!("rtsp://127.0.0.1:{port}/live");

    let mut first = Client::connect(port);
    first.publish(port);

    let mut second = Client::connect(port);
    let response = second.request(
        "ANNOUNCE",
        &uri,
        &[("Content-Type", "application/sdp")],
        Some(SDP),
    );
    assert_eq!(response.status_code, 503);

    let mut subscriber = Client::connect(port);
    subscriber.subscribe(port);
    first.send_rtp(&video_packet(1));
    assert_eq!(subscriber.read_rtp().sequence_number, 1);

    server.close();
    runner.join().unwrap().unwrap();
}

#[test]
fn malformed_requests_keep_the_connection() {
    let port = 18559;
    let (server, runner) = start(port, RelayConfig::default());
    let uri = format!("rtsp://127.0.0.1:{port}/live");

    let mut client = Client::connect(port);
    assert_eq!(client.request("ANNOUNCE", &uri, &[], None).status_code, 400);
    assert_eq!(client.request("SETUP", &uri, &[], None).status_code, 400);
    assert_eq!(client.request("PLAY", &uri, &[], None).status_code, 454);
    assert_eq!(
        client
            .request(
                "SETUP",
                &uri,
                &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record")],
                None
            )
            .status_code,
        455
    );
    let options = client.request("OPTIONS", &uri, &[], None);
    assert_eq!(options.status_code, 200);
    assert!(options.get_header("Public").unwrap().contains("ANNOUNCE"));

    server.close();
    runner.join().unwrap().unwrap();
}

#[test]
fn run_twice_and_close_twice() {
    let port = 18560;
    let (server, runner) = start(port, RelayConfig::default());
    let _probe = Client::connect(port);

    assert!(matches!(server.run(), Err(RtspError::AlreadyRunning)));

    server.close();
    server.close();
    runner.join().unwrap().unwrap();
    assert!(server.is_closed());
    // closed relays return immediately
    server.run().unwrap();
}
