//! Drives the client engine against the server engine over a real TCP
//! loopback connection, exercising the object toolkit as the backing
//! filesystem.

use std::time::Duration;
use warp9::error::ErrCode;
use warp9::fcall::{omode, FCall};
use warp9::wkit::{DirItem, Item, ObjectTree, PlainItem};
use warp9::{clnt, srv};

async fn spawn_server(port: u16) {
    let root = DirItem::new_root("/");

    let hello = PlainItem::new("hello");
    hello.write(0, b"hello, warp9\n").await.unwrap();
    root.insert(hello).await;

    let sub = DirItem::new("sub");
    let leaf = PlainItem::new("leaf");
    leaf.write(0, b"leaf contents").await.unwrap();
    sub.insert(leaf).await;
    root.insert(sub).await;

    let tree = ObjectTree::new(root);
    let addr = format!("tcp!127.0.0.1!{}", port);
    tokio::spawn(async move {
        let _ = srv::serve(tree, &addr).await;
    });
}

async fn connect(port: u16) -> (clnt::Client, clnt::Fid) {
    let addr = format!("tcp!127.0.0.1!{}", port);
    for _ in 0..50 {
        match clnt::mount(&addr, warp9::fcall::MSIZE, 0, "/").await {
            Ok(pair) => return pair,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("server never came up on {}", addr);
}

#[tokio::test]
async fn walk_open_read_roundtrip() {
    spawn_server(19101).await;
    let (_client, root) = connect(19101).await;

    let mut fid = root.walk(&["hello".to_string()]).await.unwrap();
    fid.open(omode::OREAD).await.unwrap();
    let data = fid.read(0, 64).await.unwrap();
    assert_eq!(data, b"hello, warp9\n");
    fid.clunk().await.unwrap();
}

#[tokio::test]
async fn nested_walk_resolves_subdirectory() {
    spawn_server(19102).await;
    let (_client, root) = connect(19102).await;

    let mut fid = root.walk(&["sub".to_string(), "leaf".to_string()]).await.unwrap();
    fid.open(omode::OREAD).await.unwrap();
    let data = fid.read(0, 64).await.unwrap();
    assert_eq!(data, b"leaf contents");
    fid.clunk().await.unwrap();
}

#[tokio::test]
async fn walk_failure_on_missing_component_leaves_root_usable() {
    spawn_server(19103).await;
    let (_client, root) = connect(19103).await;

    let err = root.walk(&["nope".to_string()]).await.unwrap_err();
    assert_eq!(err.code, ErrCode::Noent as i16);

    // A failed walk must not corrupt the fid it was issued against.
    let mut again = root.walk(&["hello".to_string()]).await.unwrap();
    again.open(omode::OREAD).await.unwrap();
    let data = again.read(0, 64).await.unwrap();
    assert_eq!(data, b"hello, warp9\n");
}

#[tokio::test]
async fn write_then_reopen_sees_new_contents() {
    spawn_server(19104).await;
    let (_client, root) = connect(19104).await;

    let mut fid = root.walk(&["hello".to_string()]).await.unwrap();
    fid.open(omode::OWRITE).await.unwrap();
    fid.write(0, b"overwritten").await.unwrap();
    fid.clunk().await.unwrap();

    let mut reopened = root.walk(&["hello".to_string()]).await.unwrap();
    reopened.open(omode::OREAD).await.unwrap();
    let data = reopened.read(0, 64).await.unwrap();
    assert_eq!(data, b"overwritten");
}

#[tokio::test]
async fn dotdot_from_subdirectory_returns_to_root() {
    spawn_server(19105).await;
    let (_client, root) = connect(19105).await;

    let sub = root.walk(&["sub".to_string()]).await.unwrap();
    let back = sub.walk(&["..".to_string()]).await.unwrap();
    assert_eq!(back.qid(), root.qid());
}

#[tokio::test]
async fn rpc_nb_submits_without_waiting_and_completes_later() {
    spawn_server(19106).await;
    let (client, root) = connect(19106).await;

    let rx = client.rpc_nb(FCall::Tstat { fid: root.num() }).await.unwrap();
    match rx.await.unwrap().unwrap() {
        FCall::Rstat { stat } => assert_eq!(stat.qid, root.qid()),
        other => panic!("unexpected reply: {:?}", other),
    }
}
