//! TCP ADC transport against an in-process fake ADAM listener.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use damper_hardware::adc_net::{AdcEvent, TcpAdcTransport};
use damper_traits::AdcTransport;

/// One fake ADAM: accepts a single connection, answers each 12-byte read
/// request with a 25-byte response, then closes.
fn fake_adam(replies: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        for i in 0..replies {
            let mut req = [0u8; 12];
            if stream.read_exact(&mut req).is_err() {
                return;
            }
            assert_eq!(req[7], 0x04);
            let mut resp = [0u8; 25];
            resp[..2].copy_from_slice(&req[..2]);
            resp[5] = 19;
            resp[8] = 16;
            resp[9] = i as u8; // counts[0] high byte varies per reply
            let _ = stream.write_all(&resp);
        }
    });
    addr
}

#[test]
fn connects_sends_and_receives_framed_responses() {
    let addr = fake_adam(2);
    let (tx, rx) = unbounded();
    let mut t = TcpAdcTransport::new(addr, tx);

    assert!(!t.is_connected());
    assert!(t.connect().unwrap());
    assert!(t.is_connected());

    let request = [
        0x01u8, 0x00, 0x00, 0x00, 0x00, 0x06, 0x01, 0x04, 0x00, 0x00, 0x00, 0x08,
    ];
    t.send(&request).unwrap();
    match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
        AdcEvent::Frame(f) => {
            assert_eq!(f.len(), 25);
            assert_eq!(f[9], 0);
        }
        AdcEvent::Closed => panic!("expected a frame"),
    }

    t.send(&request).unwrap();
    match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
        AdcEvent::Frame(f) => assert_eq!(f[9], 1),
        AdcEvent::Closed => panic!("expected a frame"),
    }
}

#[test]
fn peer_close_is_reported() {
    let addr = fake_adam(0);
    let (tx, rx) = unbounded();
    let mut t = TcpAdcTransport::new(addr, tx);
    assert!(t.connect().unwrap());
    // The fake closes immediately; the reader notices.
    match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
        AdcEvent::Closed => {}
        AdcEvent::Frame(_) => panic!("expected close"),
    }
}

#[test]
fn connect_to_dead_port_fails_soft() {
    // Bind then drop to get a port that refuses connections.
    let dead = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().to_string()
    };
    let (tx, _rx) = unbounded();
    let mut t = TcpAdcTransport::new(dead, tx);
    assert!(!t.connect().unwrap());
    assert!(!t.is_connected());
}
