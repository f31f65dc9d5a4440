//! End-to-end tests over real TCP with the client library.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use var_client::{NotifyChannel, VarClient};
use var_protocol::{NotifyKind, SearchQuery, VarErr, VarInfo, VarValue};
use varserver::{Config, Server};

static TEST_SEQ: AtomicUsize = AtomicUsize::new(0);

async fn start_server() -> SocketAddr {
    let config = Config {
        port: 0,
        info_path: std::env::temp_dir().join(format!(
            "varserver-test-{}-{}.info",
            std::process::id(),
            TEST_SEQ.fetch_add(1, Ordering::SeqCst)
        )),
        ..Config::default()
    };
    let server = Server::bind(config).await.expect("bind");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());
    addr
}

async fn recv_event(
    channel: &mut NotifyChannel,
) -> Result<var_protocol::NotifyMessage, var_client::ClientError> {
    timeout(Duration::from_secs(5), channel.recv())
        .await
        .expect("event within deadline")
}

#[tokio::test]
async fn round_trip_over_tcp() {
    let addr = start_server().await;
    let mut client = VarClient::connect(addr, 4096, 1000).await.unwrap();

    assert_eq!(client.echo(7).await.unwrap(), 7);

    let h = client
        .create(VarInfo::new("/a", VarValue::Int32(7)))
        .await
        .unwrap();
    assert_eq!(client.get(h).await.unwrap(), VarValue::Int32(7));
    client.set(h, VarValue::Int32(9)).await.unwrap();
    assert_eq!(client.get(h).await.unwrap(), VarValue::Int32(9));

    assert_eq!(client.find("/a").await.unwrap(), h);
    assert_eq!(client.name_of(h).await.unwrap(), "/a");
    client.close().await.unwrap();
}

#[tokio::test]
async fn modified_events_reach_the_notify_channel() {
    let addr = start_server().await;
    let mut watcher = VarClient::connect(addr, 4096, 0).await.unwrap();
    let mut setter = VarClient::connect(addr, 4096, 0).await.unwrap();

    let h = setter
        .create(VarInfo::new("/m", VarValue::Int32(0)))
        .await
        .unwrap();

    let mut channel = watcher.open_notify_channel().await.unwrap();
    watcher.notify(h, NotifyKind::Modified).await.unwrap();

    setter.set(h, VarValue::Int32(5)).await.unwrap();

    let event = recv_event(&mut channel).await.unwrap();
    assert_eq!(event.kind, NotifyKind::Modified);
    assert_eq!(event.handle, h);
}

#[tokio::test]
async fn calc_flow_over_tcp() {
    let addr = start_server().await;
    let mut calc = VarClient::connect(addr, 4096, 0).await.unwrap();

    let h = calc
        .create(VarInfo::new("/calc", VarValue::Int32(0)))
        .await
        .unwrap();
    let mut channel = calc.open_notify_channel().await.unwrap();
    calc.notify(h, NotifyKind::Calc).await.unwrap();

    // The reader blocks until the calculator writes
    let reader = tokio::spawn(async move {
        let mut reader = VarClient::connect(addr, 4096, 0).await.unwrap();
        reader.get(h).await.unwrap()
    });

    let event = recv_event(&mut channel).await.unwrap();
    assert_eq!(event.kind, NotifyKind::Calc);
    calc.set(h, VarValue::Int32(42)).await.unwrap();

    let value = timeout(Duration::from_secs(5), reader)
        .await
        .expect("reader unblocked")
        .unwrap();
    assert_eq!(value, VarValue::Int32(42));
}

#[tokio::test]
async fn one_calc_write_unblocks_every_tcp_reader() {
    let addr = start_server().await;
    let mut calc = VarClient::connect(addr, 4096, 0).await.unwrap();

    let h = calc
        .create(VarInfo::new("/calc/all", VarValue::Int32(0)))
        .await
        .unwrap();
    let mut channel = calc.open_notify_channel().await.unwrap();
    calc.notify(h, NotifyKind::Calc).await.unwrap();

    let readers: Vec<_> = (0..3)
        .map(|_| {
            tokio::spawn(async move {
                let mut reader = VarClient::connect(addr, 4096, 0).await.unwrap();
                reader.get(h).await.unwrap()
            })
        })
        .collect();

    // One calc event per parked reader
    for _ in 0..3 {
        let event = recv_event(&mut channel).await.unwrap();
        assert_eq!(event.kind, NotifyKind::Calc);
    }
    calc.set(h, VarValue::Int32(13)).await.unwrap();

    let values = timeout(Duration::from_secs(5), futures::future::join_all(readers))
        .await
        .expect("all readers unblocked");
    for value in values {
        assert_eq!(value.unwrap(), VarValue::Int32(13));
    }
}

#[tokio::test]
async fn validate_flow_over_tcp() {
    let addr = start_server().await;
    let mut validator = VarClient::connect(addr, 4096, 0).await.unwrap();
    let mut setter = VarClient::connect(addr, 4096, 0).await.unwrap();

    let h = setter
        .create(VarInfo::new("/v", VarValue::Int32(9)))
        .await
        .unwrap();
    let mut channel = validator.open_notify_channel().await.unwrap();
    validator.notify(h, NotifyKind::Validate).await.unwrap();

    let blocked_set = tokio::spawn(async move {
        let result = setter.set(h, VarValue::Int32(-1)).await;
        (setter, result)
    });

    let event = recv_event(&mut channel).await.unwrap();
    assert_eq!(event.kind, NotifyKind::Validate);
    let txn = event.txn_id;

    let (vh, proposed) = validator.get_validation_request(txn).await.unwrap();
    assert_eq!(vh, h);
    assert_eq!(proposed, VarValue::Int32(-1));
    validator
        .send_validation_response(txn, Err(VarErr::Inval))
        .await
        .unwrap();

    let (mut setter, result) = timeout(Duration::from_secs(5), blocked_set)
        .await
        .expect("setter unblocked")
        .unwrap();
    assert_eq!(result.unwrap_err().server_code(), Some(VarErr::Inval));
    assert_eq!(setter.get(h).await.unwrap(), VarValue::Int32(9));
}

#[tokio::test]
async fn print_delegation_over_tcp() {
    let addr = start_server().await;
    let mut printer = VarClient::connect(addr, 4096, 0).await.unwrap();

    let h = printer
        .create(VarInfo::new("/p", VarValue::Int32(21)))
        .await
        .unwrap();
    let mut channel = printer.open_notify_channel().await.unwrap();
    printer.notify(h, NotifyKind::Print).await.unwrap();

    let requester = tokio::spawn(async move {
        let mut requester = VarClient::connect(addr, 4096, 0).await.unwrap();
        requester.print(h).await.unwrap()
    });

    let event = recv_event(&mut channel).await.unwrap();
    assert_eq!(event.kind, NotifyKind::Print);
    let txn = event.txn_id;

    let (ph, _requester_id) = printer.open_print_session(txn).await.unwrap();
    assert_eq!(ph, h);

    let mut stream = printer.attach_print_stream(txn).await.unwrap();
    stream.write_all(b"twenty-one degrees").await.unwrap();
    stream.finish().await.unwrap();
    // Give the forwarder a beat to drain the stream into the session
    tokio::time::sleep(Duration::from_millis(100)).await;
    printer.close_print_session(txn).await.unwrap();

    let output = timeout(Duration::from_secs(5), requester)
        .await
        .expect("requester unblocked")
        .unwrap();
    assert_eq!(output, "twenty-one degrees");
}

#[tokio::test]
async fn serverside_print_uses_the_format() {
    let addr = start_server().await;
    let mut client = VarClient::connect(addr, 4096, 0).await.unwrap();
    let mut info = VarInfo::new("/fmt", VarValue::Int32(42));
    info.format = Some("%05d".to_string());
    let h = client.create(info).await.unwrap();
    assert_eq!(client.print(h).await.unwrap(), "00042");
}

#[tokio::test]
async fn oversized_values_arrive_in_chunks() {
    let addr = start_server().await;
    let mut writer = VarClient::connect(addr, 4096, 0).await.unwrap();
    let body = "z".repeat(700);
    let h = writer
        .create(VarInfo::new("/big", VarValue::Str(body.clone())))
        .await
        .unwrap();

    // A client with the minimum working buffer still reads the whole value
    let mut small = VarClient::connect(addr, 1, 0).await.unwrap();
    assert_eq!(small.get(h).await.unwrap(), VarValue::Str(body));
}

#[tokio::test]
async fn iteration_over_tcp() {
    let addr = start_server().await;
    let mut client = VarClient::connect(addr, 4096, 0).await.unwrap();
    client
        .create(VarInfo::new("/list/a", VarValue::Int32(1)))
        .await
        .unwrap();
    client
        .create(VarInfo::new("/list/b", VarValue::Int32(2)))
        .await
        .unwrap();

    let query = SearchQuery {
        name_match: Some("/list/".to_string()),
        ..SearchQuery::default()
    };
    let mut names = Vec::new();
    let mut item = client.get_first(query).await.unwrap();
    while let Some(current) = item {
        names.push(current.name.clone());
        item = client.get_next(current.context).await.unwrap();
    }
    assert_eq!(names, vec!["/list/a".to_string(), "/list/b".to_string()]);
}

#[tokio::test]
async fn stats_variables_are_served() {
    let addr = start_server().await;
    let mut client = VarClient::connect(addr, 4096, 0).await.unwrap();
    let h = client.find("/varserver/stats/total_requests").await.unwrap();
    assert!(h.is_valid());
    // Readable like any variable
    match client.get(h).await.unwrap() {
        VarValue::UInt64(_) => {}
        other => panic!("unexpected stats type {other:?}"),
    }
}

#[tokio::test]
async fn bad_magic_closes_the_connection() {
    let addr = start_server().await;
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(&[0u8; 64]).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server reacts")
        .unwrap();
    assert_eq!(n, 0, "connection torn down without a response");
}

#[tokio::test]
async fn notify_bind_for_unknown_client_is_refused() {
    let addr = start_server().await;
    let err = NotifyChannel::open(addr, 199).await.unwrap_err();
    assert_eq!(err.server_code(), Some(VarErr::NoEnt));
}

#[tokio::test]
async fn duplicate_create_is_eexist() {
    let addr = start_server().await;
    let mut client = VarClient::connect(addr, 4096, 0).await.unwrap();
    client
        .create(VarInfo::new("/dup", VarValue::Int32(0)))
        .await
        .unwrap();
    let err = client
        .create(VarInfo::new("/dup", VarValue::Int32(1)))
        .await
        .unwrap_err();
    assert_eq!(err.server_code(), Some(VarErr::Exist));
}
