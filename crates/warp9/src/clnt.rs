//! Asynchronous client-side Warp9 engine.
//!
//! Grounded in `original_source/warp9/clnt_clnt.go` (`Clnt`/`Fid`/`Req`,
//! `Rpc`/`Rpcnb`, the `recv`/`send` goroutines, pool-backed tag/fid
//! allocation) and `clnt_mount.go`/`clnt_walk.go` (`Mount`, `Attach`,
//! 16-name-chunked `Walk`), expressed with tokio tasks in place of the
//! original's goroutine-per-connection pair — the same reader/writer task
//! split `srv.rs` already uses on the server side.

use crate::{
    error::{Error, ErrCode, Result},
    fcall::*,
    serialize,
};
use bytes::buf::BufMut;
use futures::sink::SinkExt;
use log::{debug, error, info};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, UnixStream},
    sync::{Mutex, oneshot},
};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite, length_delimited::LengthDelimitedCodec};

/// A free-list-backed id allocator reserving one sentinel value, matching
/// the reference implementation's `pool` type (`tagpool`/`fidpool`).
struct IdPool {
    sentinel: u32,
    next: u32,
    free: VecDeque<u32>,
}

impl IdPool {
    fn new(sentinel: u32) -> Self {
        IdPool { sentinel, next: 0, free: VecDeque::new() }
    }

    fn get(&mut self) -> u32 {
        if let Some(id) = self.free.pop_front() {
            return id;
        }
        loop {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if id != self.sentinel {
                return id;
            }
        }
    }

    fn put(&mut self, id: u32) {
        self.free.push_back(id);
    }
}

enum PendingReply {
    Fcall(FCall),
    Closed,
}

struct ClientInner {
    msize: AtomicU32,
    tags: Mutex<IdPool>,
    fids: Mutex<IdPool>,
    pending: Mutex<HashMap<u16, oneshot::Sender<PendingReply>>>,
    write_tx: tokio::sync::mpsc::Sender<(u16, FCall)>,
}

impl ClientInner {
    async fn alloc_tag(&self) -> u16 {
        self.tags.lock().await.get() as u16
    }

    async fn free_tag(&self, tag: u16) {
        self.tags.lock().await.put(tag as u32);
    }

    async fn alloc_fid(&self) -> u32 {
        self.fids.lock().await.get()
    }

    async fn free_fid(&self, fid: u32) {
        self.fids.lock().await.put(fid);
    }

    /// Sends `body` under `tag` and waits for the matching reply. `tag` is
    /// `NOTAG` only for the initial `Tversion`.
    async fn rpc(&self, tag: u16, body: FCall) -> Result<FCall> {
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.lock().await.insert(tag, done_tx);

        if self.write_tx.send((tag, body)).await.is_err() {
            self.pending.lock().await.remove(&tag);
            return Err(Error::new(ErrCode::Econn));
        }

        match done_rx.await {
            Ok(PendingReply::Fcall(FCall::Rerror { code, ename })) => {
                Err(Error { code, msg: ename })
            }
            Ok(PendingReply::Fcall(fcall)) => Ok(fcall),
            Ok(PendingReply::Closed) | Err(_) => Err(Error::new(ErrCode::Econn)),
        }
    }
}

/// Submits `body` under `tag` without waiting, delivering the translated
/// result to `done` once the matching reply (or a connection close) arrives.
/// Mirrors `Rpcnb`, which `Rpc` is itself built from in the reference
/// implementation.
async fn submit_nb(
    inner: Arc<ClientInner>,
    tag: u16,
    body: FCall,
    done: oneshot::Sender<Result<FCall>>,
) -> Result<()> {
    let (done_tx, done_rx) = oneshot::channel();
    inner.pending.lock().await.insert(tag, done_tx);

    if inner.write_tx.send((tag, body)).await.is_err() {
        inner.pending.lock().await.remove(&tag);
        let _ = done.send(Err(Error::new(ErrCode::Econn)));
        return Err(Error::new(ErrCode::Econn));
    }

    tokio::spawn(async move {
        let result = match done_rx.await {
            Ok(PendingReply::Fcall(FCall::Rerror { code, ename })) => {
                Err(Error { code, msg: ename })
            }
            Ok(PendingReply::Fcall(fcall)) => Ok(fcall),
            Ok(PendingReply::Closed) | Err(_) => Err(Error::new(ErrCode::Econn)),
        };
        inner.free_tag(tag).await;
        let _ = done.send(result);
    });
    Ok(())
}

/// A handle to an object on the server, obtained via [`Client::attach`] or
/// [`Fid::walk`]. Dropping a `Fid` does not clunk it — call
/// [`Fid::clunk`] explicitly to release the server-side resource.
#[derive(Clone)]
pub struct Fid {
    num: u32,
    qid: Qid,
    client: Arc<ClientInner>,
}

impl Fid {
    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn qid(&self) -> Qid {
        self.qid
    }

    /// Walks `wname` from this fid into a freshly allocated fid, chunking
    /// the name list into groups of 16 per message (the protocol ceiling)
    /// and failing atomically per chunk: if a chunk's `Twalk` errors, the
    /// newly allocated fid is released and the error is returned without
    /// walking any further chunks.
    pub async fn walk(&self, wname: &[String]) -> Result<Fid> {
        let newfid_num = self.client.alloc_fid().await;
        let mut cur_fid = self.num;
        let mut cur_qid = self.qid;

        if wname.is_empty() {
            let tag = self.client.alloc_tag().await;
            let reply = self
                .client
                .rpc(tag, FCall::Twalk { fid: cur_fid, newfid: newfid_num, wname: Vec::new() })
                .await;
            self.client.free_tag(tag).await;
            return match reply {
                Ok(FCall::Rwalk { wqid }) => {
                    Ok(Fid { num: newfid_num, qid: wqid, client: self.client.clone() })
                }
                Ok(_) => Err(Error::new(ErrCode::Badw9msg)),
                Err(e) => {
                    self.client.free_fid(newfid_num).await;
                    Err(e)
                }
            };
        }

        for (i, chunk) in wname.chunks(16).enumerate() {
            let from_fid = if i == 0 { cur_fid } else { newfid_num };
            let tag = self.client.alloc_tag().await;
            let reply = self
                .client
                .rpc(tag, FCall::Twalk { fid: from_fid, newfid: newfid_num, wname: chunk.to_vec() })
                .await;
            self.client.free_tag(tag).await;
            match reply {
                Ok(FCall::Rwalk { wqid }) => {
                    cur_fid = newfid_num;
                    cur_qid = wqid;
                }
                Ok(_) => {
                    self.clunk_failed_walk(i, newfid_num).await;
                    return Err(Error::new(ErrCode::Badw9msg));
                }
                Err(e) => {
                    self.clunk_failed_walk(i, newfid_num).await;
                    return Err(e);
                }
            }
        }

        Ok(Fid { num: newfid_num, qid: cur_qid, client: self.client.clone() })
    }

    /// After chunk `i` of a chunked walk fails: if `i > 0`, the server
    /// already holds `newfid` pointing at the last successfully walked
    /// chunk, so it must be clunked server-side before the local id is
    /// freed (mirrors the reference `Walk`'s `goto error; Clnt.Clunk`).
    async fn clunk_failed_walk(&self, i: usize, newfid_num: u32) {
        if i > 0 {
            let tag = self.client.alloc_tag().await;
            let _ = self.client.rpc(tag, FCall::Tclunk { fid: newfid_num }).await;
            self.client.free_tag(tag).await;
        }
        self.client.free_fid(newfid_num).await;
    }

    pub async fn open(&mut self, mode: u8) -> Result<u32> {
        let tag = self.client.alloc_tag().await;
        let reply = self.client.rpc(tag, FCall::Topen { fid: self.num, mode }).await;
        self.client.free_tag(tag).await;
        match reply? {
            FCall::Ropen { qid, iounit } => {
                self.qid = qid;
                Ok(iounit)
            }
            _ => Err(Error::new(ErrCode::Badw9msg)),
        }
    }

    pub async fn create(&mut self, name: impl Into<String>, perm: u32, mode: u8) -> Result<u32> {
        let tag = self.client.alloc_tag().await;
        let reply = self
            .client
            .rpc(tag, FCall::Tcreate { fid: self.num, name: name.into(), perm, mode })
            .await;
        self.client.free_tag(tag).await;
        match reply? {
            FCall::Rcreate { qid, iounit } => {
                self.qid = qid;
                Ok(iounit)
            }
            _ => Err(Error::new(ErrCode::Badw9msg)),
        }
    }

    pub async fn read(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        let cap = self.client.msize.load(Ordering::SeqCst) - IOHDRSZ;
        let count = count.min(cap);
        let tag = self.client.alloc_tag().await;
        let reply = self.client.rpc(tag, FCall::Tread { fid: self.num, offset, count }).await;
        self.client.free_tag(tag).await;
        match reply? {
            FCall::Rread { data } => Ok(data.0),
            _ => Err(Error::new(ErrCode::Badw9msg)),
        }
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        if (data.len() as u32) + IOHDRSZ > self.client.msize.load(Ordering::SeqCst) {
            return Err(Error::new(ErrCode::Toolarge));
        }
        let tag = self.client.alloc_tag().await;
        let reply = self
            .client
            .rpc(tag, FCall::Twrite { fid: self.num, offset, data: Data(data.to_vec()) })
            .await;
        self.client.free_tag(tag).await;
        match reply? {
            FCall::Rwrite { count } => Ok(count),
            _ => Err(Error::new(ErrCode::Badw9msg)),
        }
    }

    pub async fn clunk(self) -> Result<()> {
        let tag = self.client.alloc_tag().await;
        let reply = self.client.rpc(tag, FCall::Tclunk { fid: self.num }).await;
        self.client.free_tag(tag).await;
        self.client.free_fid(self.num).await;
        match reply? {
            FCall::Rclunk => Ok(()),
            _ => Err(Error::new(ErrCode::Badw9msg)),
        }
    }

    pub async fn remove(self) -> Result<()> {
        let tag = self.client.alloc_tag().await;
        let reply = self.client.rpc(tag, FCall::Tremove { fid: self.num }).await;
        self.client.free_tag(tag).await;
        self.client.free_fid(self.num).await;
        match reply? {
            FCall::Rremove => Ok(()),
            _ => Err(Error::new(ErrCode::Badw9msg)),
        }
    }

    pub async fn stat(&self) -> Result<Dir> {
        let tag = self.client.alloc_tag().await;
        let reply = self.client.rpc(tag, FCall::Tstat { fid: self.num }).await;
        self.client.free_tag(tag).await;
        match reply? {
            FCall::Rstat { stat } => Ok(stat),
            _ => Err(Error::new(ErrCode::Badw9msg)),
        }
    }

    pub async fn wstat(&self, stat: Dir) -> Result<()> {
        let tag = self.client.alloc_tag().await;
        let reply = self.client.rpc(tag, FCall::Twstat { fid: self.num, stat }).await;
        self.client.free_tag(tag).await;
        match reply? {
            FCall::Rwstat => Ok(()),
            _ => Err(Error::new(ErrCode::Badw9msg)),
        }
    }
}

/// A live connection to a Warp9 server, negotiated and attached.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connects and negotiates the version (tag `NOTAG`), matching
    /// `Connect`/`NewClnt` in the reference implementation. Does not attach.
    async fn new<R, W>(reader: R, writer: W, msize: u32) -> Result<Self>
    where
        R: 'static + AsyncRead + Send + Unpin,
        W: 'static + AsyncWrite + Send + Unpin,
    {
        let (write_tx, write_rx) = tokio::sync::mpsc::channel(16);
        let inner = Arc::new(ClientInner {
            msize: AtomicU32::new(msize),
            tags: Mutex::new(IdPool::new(NOTAG as u32)),
            fids: Mutex::new(IdPool::new(NOFID)),
            pending: Mutex::new(HashMap::new()),
            write_tx,
        });

        let framedread = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .num_skip(0)
            .little_endian()
            .new_read(reader);
        let framedwrite = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_write(writer);

        spawn_writer(framedwrite, write_rx);
        spawn_reader(framedread, inner.clone());

        let client = Client { inner };

        let tag = NOTAG;
        let reply = client
            .inner
            .rpc(tag, FCall::Tversion { msize, version: WARP9_VERSION.to_string() })
            .await?;
        match reply {
            FCall::Rversion { msize: negotiated, version } => {
                if parse_version(&version).is_none() && version != VERSION_UNKNOWN {
                    return Err(Error::new(ErrCode::Badver));
                }
                client.inner.msize.store(negotiated.min(msize), Ordering::SeqCst);
                Ok(client)
            }
            _ => Err(Error::new(ErrCode::Badw9msg)),
        }
    }

    /// Negotiates `auth` for the given user, returning an auth fid ready to
    /// be handed to [`Client::attach`]. Mirrors `Clnt.Auth`.
    pub async fn auth(&self, uid: u32, aname: &str) -> Result<Fid> {
        let afid_num = self.inner.alloc_fid().await;
        let tag = self.inner.alloc_tag().await;
        let reply = self
            .inner
            .rpc(tag, FCall::Tauth { afid: afid_num, uid, aname: aname.to_string() })
            .await;
        self.inner.free_tag(tag).await;
        match reply {
            Ok(FCall::Rauth { aqid }) => Ok(Fid { num: afid_num, qid: aqid, client: self.inner.clone() }),
            Ok(_) => {
                self.inner.free_fid(afid_num).await;
                Err(Error::new(ErrCode::Badw9msg))
            }
            Err(e) => {
                self.inner.free_fid(afid_num).await;
                Err(e)
            }
        }
    }

    /// Attaches to the server's namespace, returning a fid for the root.
    /// `afid` is `None` when no authentication is required. Mirrors
    /// `Clnt.Attach`.
    pub async fn attach(&self, afid: Option<&Fid>, uid: u32, aname: &str) -> Result<Fid> {
        let fid_num = self.inner.alloc_fid().await;
        let afno = afid.map(|f| f.num).unwrap_or(NOFID);
        let tag = self.inner.alloc_tag().await;
        let reply = self
            .inner
            .rpc(tag, FCall::Tattach { fid: fid_num, afid: afno, uid, aname: aname.to_string() })
            .await;
        self.inner.free_tag(tag).await;
        match reply {
            Ok(FCall::Rattach { qid }) => Ok(Fid { num: fid_num, qid, client: self.inner.clone() }),
            Ok(_) => {
                self.inner.free_fid(fid_num).await;
                Err(Error::new(ErrCode::Badw9msg))
            }
            Err(e) => {
                self.inner.free_fid(fid_num).await;
                Err(e)
            }
        }
    }

    pub fn msize(&self) -> u32 {
        self.inner.msize.load(Ordering::SeqCst)
    }

    /// Non-blocking tagged RPC: allocates a tag, submits `body`, and returns
    /// immediately with a receiver the caller can await (or hand off
    /// elsewhere) whenever it wants the reply. Mirrors `Clnt.Rpcnb`, which
    /// `Clnt.Rpc` — [`Fid`]'s blocking calls, above — is itself built from.
    pub async fn rpc_nb(&self, body: FCall) -> Result<oneshot::Receiver<Result<FCall>>> {
        let tag = self.inner.alloc_tag().await;
        let (tx, rx) = oneshot::channel();
        if let Err(e) = submit_nb(self.inner.clone(), tag, body, tx).await {
            self.inner.free_tag(tag).await;
            return Err(e);
        }
        Ok(rx)
    }
}

fn spawn_writer<W>(
    mut framedwrite: FramedWrite<W, LengthDelimitedCodec>,
    mut write_rx: tokio::sync::mpsc::Receiver<(u16, FCall)>,
) where
    W: 'static + AsyncWrite + Send + Unpin,
{
    tokio::spawn(async move {
        while let Some((tag, body)) = write_rx.recv().await {
            let msg = Msg { tag, body };
            let bytes = match serialize::write_msg(&msg) {
                Ok(b) => b,
                Err(e) => {
                    error!("failed to encode request for tag {}: {}", tag, e);
                    continue;
                }
            };
            debug!("\t-> {:?}", msg);
            let mut frame = bytes::BytesMut::with_capacity(bytes.len());
            frame.put_slice(&bytes[4..]); // LengthDelimitedCodec re-adds the size prefix
            if let Err(e) = framedwrite.send(frame.freeze()).await {
                error!("failed to send request for tag {}: {}", tag, e);
                return;
            }
        }
    });
}

fn spawn_reader<R>(mut framedread: FramedRead<R, LengthDelimitedCodec>, inner: Arc<ClientInner>)
where
    R: 'static + AsyncRead + Send + Unpin,
{
    tokio::spawn(async move {
        while let Some(bytes) = framedread.next().await {
            let bytes = match bytes {
                Ok(b) => b,
                Err(e) => {
                    error!("frame read error: {}", e);
                    break;
                }
            };
            let msg = match serialize::read_msg(&bytes) {
                Ok((msg, _)) => msg,
                Err(e) => {
                    error!("malformed reply: {}", e);
                    continue;
                }
            };
            debug!("\t<- {:?}", msg);
            if let Some(done) = inner.pending.lock().await.remove(&msg.tag) {
                let _ = done.send(PendingReply::Fcall(msg.body));
            }
        }

        info!("connection closed");
        let mut pending = inner.pending.lock().await;
        for (_, done) in pending.drain() {
            let _ = done.send(PendingReply::Closed);
        }
    });
}

/// Connects to `addr` (a `"tcp!host!port"` or `"unix!path!0"` dial string),
/// negotiates the version, attaches as `uid` to `aname`, and registers the
/// resulting client. Mirrors `Mount`/`MountConn`.
pub async fn mount(addr: &str, msize: u32, uid: u32, aname: &str) -> Result<(Client, Fid)> {
    let (proto, host, port) = crate::utils::parse_proto(addr).ok_or_else(Error::einval)?;
    let client = match proto {
        "tcp" => {
            let stream = TcpStream::connect(format!("{}:{}", host, port)).await.map_err(Error::from)?;
            let (r, w) = stream.into_split();
            Client::new(r, w, msize).await?
        }
        "unix" => {
            let stream = UnixStream::connect(host).await.map_err(Error::from)?;
            let (r, w) = tokio::io::split(stream);
            Client::new(r, w, msize).await?
        }
        _ => return Err(Error::einval()),
    };

    let root = client.attach(None, uid, aname).await?;
    registry().register(&client.inner);
    Ok((client, root))
}

/// Listens on `addr` and, for every accepted connection, performs the
/// attach *as the client* against the freshly connected peer (which must
/// itself speak the server side of Warp9) — the reverse of the usual
/// dial-out `mount`. Each successful attach is delivered to `on_mount`;
/// connection- and negotiation-level failures are logged and skipped.
pub async fn reverse_mount<F>(addr: &str, msize: u32, uid: u32, aname: &str, on_mount: F) -> Result<()>
where
    F: Fn(Client, Fid) + Send + Sync + 'static + Clone,
{
    let (proto, host, port) = crate::utils::parse_proto(addr).ok_or_else(Error::einval)?;
    match proto {
        "tcp" => {
            let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port))
                .await
                .map_err(Error::from)?;
            loop {
                let (stream, peer) = listener.accept().await.map_err(Error::from)?;
                info!("reverse mount accepted: {:?}", peer);
                let (r, w) = stream.into_split();
                spawn_reverse_attach(r, w, msize, uid, aname.to_string(), on_mount.clone());
            }
        }
        "unix" => {
            let listener = tokio::net::UnixListener::bind(host).map_err(Error::from)?;
            loop {
                let (stream, _) = listener.accept().await.map_err(Error::from)?;
                info!("reverse mount accepted (unix)");
                let (r, w) = tokio::io::split(stream);
                spawn_reverse_attach(r, w, msize, uid, aname.to_string(), on_mount.clone());
            }
        }
        _ => Err(Error::einval()),
    }
}

fn spawn_reverse_attach<R, W, F>(r: R, w: W, msize: u32, uid: u32, aname: String, on_mount: F)
where
    R: 'static + AsyncRead + Send + Unpin,
    W: 'static + AsyncWrite + Send + Unpin,
    F: Fn(Client, Fid) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        match Client::new(r, w, msize).await {
            Ok(client) => match client.attach(None, uid, &aname).await {
                Ok(root) => {
                    registry().register(&client.inner);
                    on_mount(client, root);
                }
                Err(e) => error!("reverse mount attach failed: {}", e),
            },
            Err(e) => error!("reverse mount negotiation failed: {}", e),
        }
    });
}

/// A process-wide registry of live clients, so a debug surface can
/// enumerate active sessions. Grounded in `clnt_clnt.go`'s `ClntList`;
/// expressed in-process rather than over HTTP (see `clnt_stats_http.go` —
/// HTTP serving is out of scope here).
pub struct ClientRegistry {
    clients: std::sync::Mutex<Vec<Weak<ClientInner>>>,
}

impl ClientRegistry {
    fn register(&self, inner: &Arc<ClientInner>) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|w| w.strong_count() > 0);
        clients.push(Arc::downgrade(inner));
    }

    /// Number of clients currently alive.
    pub fn len(&self) -> usize {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|w| w.strong_count() > 0);
        clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static REGISTRY: std::sync::OnceLock<ClientRegistry> = std::sync::OnceLock::new();

pub fn registry() -> &'static ClientRegistry {
    REGISTRY.get_or_init(|| ClientRegistry { clients: std::sync::Mutex::new(Vec::new()) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_pool_reserves_sentinel_and_reuses_freed_ids() {
        let mut pool = IdPool::new(2);
        assert_eq!(pool.get(), 0);
        assert_eq!(pool.get(), 1);
        assert_eq!(pool.get(), 3); // 2 is the sentinel, skipped
        pool.put(0);
        assert_eq!(pool.get(), 0);
    }

    #[test]
    fn registry_starts_empty() {
        assert!(registry().is_empty());
    }
}
