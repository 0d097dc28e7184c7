//! Asynchronous server-side Warp9 engine.
//!
//! Grounded in the teacher's `dispatch`/`dispatch_once`/`srv_async_*` shape
//! (length-delimited framing, one spawned task per connection, one spawned
//! task per in-flight request) and in `original_source/wkit/srv.go` /
//! `srvobj.go` for the fid lifecycle: a table entry starts with one
//! reference, each in-flight request naming the fid takes one more, and the
//! fid's destroy hook fires exactly once when the count reaches zero.

use crate::{
    error::{Error, ErrCode, Result},
    fcall::*,
    serialize,
};
use async_trait::async_trait;
use bitflags::bitflags;
use bytes::buf::BufMut;
use futures::sink::SinkExt;
use log::{debug, error, info, warn};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    sync::atomic::{AtomicU32, Ordering},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, UnixListener},
    sync::Mutex,
};
use tokio_stream::StreamExt;
use tokio_util::codec::length_delimited::LengthDelimitedCodec;

bitflags! {
    /// Lifecycle flags of one in-flight request, tracked so a `Tflush` can
    /// find its target and a chaser chain of flushes can be served in order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReqStatus: u8 {
        /// A `Tflush` has been issued against this request.
        const FLUSH     = 0x1;
        /// The handler is actively running.
        const WORK      = 0x2;
        /// A reply has been sent for this tag.
        const RESPONDED = 0x4;
        /// The reply is retained for logging/inspection after sending.
        const SAVED     = 0x8;
    }
}

struct PendingReq {
    status: ReqStatus,
    /// Tags of `Tflush` requests chasing this one, in issue order.
    chasers: Vec<u16>,
}

type ReqTable = Mutex<HashMap<u16, PendingReq>>;

/// Per-fid server-side state: the refcount described above plus whatever
/// per-object state the filesystem implementation wants to hang off a fid.
struct FidState<T> {
    refcount: u32,
    opened: bool,
    mode: u8,
    qid: Option<Qid>,
    /// Cumulative bytes returned by prior directory reads on this fid, used
    /// to enforce the exact-offset-match rule on subsequent reads.
    diroffset: u64,
    pub aux: T,
}

impl<T: Default> FidState<T> {
    fn new() -> Self {
        FidState { refcount: 1, opened: false, mode: 0, qid: None, diroffset: 0, aux: T::default() }
    }
}

/// A handle to one fid's server-side state, shared between the table and
/// every in-flight request currently naming it.
pub struct Fid<T> {
    num: u32,
    inner: Arc<Mutex<FidState<T>>>,
}

impl<T> Fid<T> {
    pub fn num(&self) -> u32 {
        self.num
    }

    /// Replaces this fid's per-object state.
    pub async fn set_aux(&self, aux: T) {
        self.inner.lock().await.aux = aux;
    }

    /// Runs `f` against a reference to this fid's per-object state.
    pub async fn with_aux<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.lock().await.aux)
    }
}

impl<T: Clone> Fid<T> {
    /// Clones out this fid's per-object state.
    pub async fn aux(&self) -> T {
        self.inner.lock().await.aux.clone()
    }
}

type FidTable<T> = Mutex<HashMap<u32, Arc<Mutex<FidState<T>>>>>;

async fn acquire<T: Default>(table: &FidTable<T>, fid: u32) -> Result<Fid<T>> {
    let mut guard = table.lock().await;
    let entry = guard.get_mut(&fid).ok_or_else(Error::unknownfid)?;
    entry.lock().await.refcount += 1;
    Ok(Fid { num: fid, inner: entry.clone() })
}

async fn insert_new<T: Default>(table: &FidTable<T>, fid: u32) -> Result<Fid<T>> {
    let mut guard = table.lock().await;
    if guard.contains_key(&fid) {
        return Err(Error::inuse());
    }
    let inner = Arc::new(Mutex::new(FidState::new()));
    guard.insert(fid, inner.clone());
    Ok(Fid { num: fid, inner })
}

/// Drops one reference. When the count reaches zero the entry is removed
/// from the table and `Filesystem::fid_destroy` fires exactly once.
async fn release<Fs: Filesystem>(table: &FidTable<Fs::Fid>, fs: &Fs, fid: &Fid<Fs::Fid>) {
    let last = {
        let mut st = fid.inner.lock().await;
        st.refcount -= 1;
        st.refcount == 0
    };
    if last {
        table.lock().await.remove(&fid.num);
        let st = fid.inner.lock().await;
        fs.fid_destroy(&st.aux).await;
    }
}

/// The trait implemented by an object server. One method per Warp9
/// operation; `fid_destroy` fires when a fid's reference count reaches
/// zero, mirroring `srvobj.go`'s `FidDestroy`.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Per-fid application state (the toolkit's object tree keeps a trait
    /// object handle to the walked `Item` here).
    type Fid: Send + Sync + Default;

    /// Negotiates the protocol version and message size. The default
    /// implementation accepts the implementation's own version string and
    /// politely declines anything else rather than erroring, per the
    /// lenient-version-handling rule.
    async fn rversion(&self, msize: u32, version: &str) -> Result<(u32, String)> {
        match parse_version(version) {
            Some(_) if version == WARP9_VERSION => Ok((msize.min(MSIZE), WARP9_VERSION.to_owned())),
            _ => Ok((msize.min(MSIZE), VERSION_UNKNOWN.to_owned())),
        }
    }

    async fn rauth(&self, _afid: &Fid<Self::Fid>, _uid: u32, _aname: &str) -> Result<Qid> {
        Err(Error::new(ErrCode::Noauth))
    }

    async fn rattach(
        &self,
        fid: &Fid<Self::Fid>,
        afid: Option<&Fid<Self::Fid>>,
        uid: u32,
        aname: &str,
    ) -> Result<Qid>;

    async fn rwalk(&self, fid: &Fid<Self::Fid>, newfid: &Fid<Self::Fid>, wname: &[String]) -> Result<Qid>;

    async fn ropen(&self, fid: &Fid<Self::Fid>, mode: u8) -> Result<(Qid, u32)>;

    async fn rcreate(
        &self,
        fid: &Fid<Self::Fid>,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<(Qid, u32)> {
        let _ = (fid, name, perm, mode);
        Err(Error::new(ErrCode::Notimpl))
    }

    async fn rread(&self, fid: &Fid<Self::Fid>, offset: u64, count: u32) -> Result<Vec<u8>>;

    async fn rwrite(&self, fid: &Fid<Self::Fid>, offset: u64, data: &[u8]) -> Result<u32> {
        let _ = (fid, offset, data);
        Err(Error::new(ErrCode::Notimpl))
    }

    async fn rremove(&self, fid: &Fid<Self::Fid>) -> Result<()> {
        let _ = fid;
        Err(Error::new(ErrCode::Notimpl))
    }

    async fn rstat(&self, fid: &Fid<Self::Fid>) -> Result<Dir>;

    async fn rwstat(&self, fid: &Fid<Self::Fid>, stat: &Dir) -> Result<()> {
        let _ = (fid, stat);
        Err(Error::new(ErrCode::Notimpl))
    }

    /// Fires once when a fid's reference count reaches zero (after the
    /// owning `Tclunk`/`Tremove` completes and every in-flight request
    /// naming it has finished). Default is a no-op.
    async fn fid_destroy(&self, _aux: &Self::Fid) {}

    /// Advisory hook called when a `Tflush` targets a still-running
    /// request; the handler may use this to cancel blocking I/O early.
    /// Default is a no-op — the original request still runs to completion.
    async fn flush(&self, _oldtag: u16) {}

    /// Called once per accepted connection, before any message is
    /// processed.
    async fn conn_opened(&self) {}

    /// Called once a connection's read half returns EOF, after every fid it
    /// still held has been clunked out from under it.
    async fn conn_closed(&self) {}
}

async fn clunk_all<Fs: Filesystem>(table: &FidTable<Fs::Fid>, fs: &Fs) {
    let fids: Vec<u32> = table.lock().await.keys().copied().collect();
    for fidnum in fids {
        if let Ok(fid) = acquire(table, fidnum).await {
            release::<Fs>(table, fs, &fid).await; // drop the request-side ref we just took
            release::<Fs>(table, fs, &fid).await; // drop the table's own ref
        }
    }
}

async fn handle_tflush(reqs: &ReqTable, fs_tag: u16, oldtag: u16) -> Option<FCall> {
    let mut guard = reqs.lock().await;
    match guard.get_mut(&oldtag) {
        None => Some(FCall::Rflush),
        Some(target) if target.status.contains(ReqStatus::RESPONDED) => Some(FCall::Rflush),
        Some(target) => {
            target.status |= ReqStatus::FLUSH;
            target.chasers.push(fs_tag);
            None
        }
    }
}

/// Processes one request to completion: resolves the fids it names, invokes
/// the matching `Filesystem` method, applies fid-table side effects
/// (insert on successful walk, drop on clunk/remove), and returns the
/// reply body.
async fn dispatch_once<Fs: Filesystem>(
    body: &FCall,
    fs: &Fs,
    fids: &FidTable<Fs::Fid>,
    msize: u32,
) -> Result<FCall> {
    use FCall::*;
    match body {
        Tattach { fid, afid, uid, aname } => {
            let newfid = insert_new(fids, *fid).await?;
            let afid_handle = if *afid != NOFID { Some(acquire(fids, *afid).await?) } else { None };
            let result = fs.rattach(&newfid, afid_handle.as_ref(), *uid, aname).await;
            if let Some(a) = afid_handle {
                release(fids, fs, &a).await;
            }
            match result {
                Ok(qid) => {
                    newfid.inner.lock().await.qid = Some(qid);
                    Ok(Rattach { qid })
                }
                Err(e) => {
                    fids.lock().await.remove(fid);
                    Err(e)
                }
            }
        }
        Tauth { afid, uid, aname } => {
            let newfid = insert_new(fids, *afid).await?;
            let result = fs.rauth(&newfid, *uid, aname).await;
            match result {
                Ok(qid) => {
                    newfid.inner.lock().await.qid = Some(qid);
                    Ok(Rauth { aqid: qid })
                }
                Err(e) => {
                    fids.lock().await.remove(afid);
                    Err(e)
                }
            }
        }
        Twalk { fid, newfid, wname } => {
            let src = acquire(fids, *fid).await?;
            if src.inner.lock().await.opened {
                release(fids, fs, &src).await;
                return Err(Error::open());
            }
            let same = fid == newfid;
            let dst = if same { Fid { num: src.num, inner: src.inner.clone() } } else { insert_new(fids, *newfid).await? };
            let result = fs.rwalk(&src, &dst, wname).await;
            release(fids, fs, &src).await;
            match result {
                Ok(qid) => {
                    if !same {
                        dst.inner.lock().await.qid = Some(qid);
                    }
                    Ok(Rwalk { wqid: qid })
                }
                Err(e) => {
                    if !same {
                        fids.lock().await.remove(newfid);
                    }
                    Err(e)
                }
            }
        }
        Topen { fid, mode } => {
            let handle = acquire(fids, *fid).await?;
            let is_dir = handle.inner.lock().await.qid.map(|q| q.typ.contains(QidType::DIR)).unwrap_or(false);
            if is_dir && *mode != omode::OREAD {
                release(fids, fs, &handle).await;
                return Err(Error::perm());
            }
            let result = fs.ropen(&handle, *mode).await;
            if let Ok((qid, iounit)) = &result {
                let mut st = handle.inner.lock().await;
                st.opened = true;
                st.mode = *mode;
                st.qid = Some(*qid);
                let _ = iounit;
            }
            release(fids, fs, &handle).await;
            result.map(|(qid, iounit)| Ropen { qid, iounit })
        }
        Tcreate { fid, name, perm, mode } => {
            let handle = acquire(fids, *fid).await?;
            let result = fs.rcreate(&handle, name, *perm, *mode).await;
            if let Ok((qid, _)) = &result {
                let mut st = handle.inner.lock().await;
                st.opened = true;
                st.mode = *mode;
                st.qid = Some(*qid);
            }
            release(fids, fs, &handle).await;
            result.map(|(qid, iounit)| Rcreate { qid, iounit })
        }
        Tread { fid, offset, count } => {
            if count.checked_add(IOHDRSZ).map_or(true, |total| total > msize) {
                return Err(Error::new(ErrCode::Toolarge));
            }
            let handle = acquire(fids, *fid).await?;
            let is_dir = handle.inner.lock().await.qid.map(|q| q.typ.contains(QidType::DIR)).unwrap_or(false);
            if is_dir && *offset != 0 {
                let expect = handle.inner.lock().await.diroffset;
                if *offset != expect {
                    release(fids, fs, &handle).await;
                    return Err(Error::new(ErrCode::Badoffset));
                }
            }
            let result = fs.rread(&handle, *offset, *count).await;
            if let Ok(data) = &result {
                if is_dir {
                    let mut st = handle.inner.lock().await;
                    st.diroffset = if *offset == 0 { data.len() as u64 } else { st.diroffset + data.len() as u64 };
                }
            }
            release(fids, fs, &handle).await;
            result.map(|data| Rread { data: Data(data) })
        }
        Twrite { fid, offset, data } => {
            if (data.0.len() as u32).checked_add(IOHDRSZ).map_or(true, |total| total > msize) {
                return Err(Error::new(ErrCode::Toolarge));
            }
            let handle = acquire(fids, *fid).await?;
            let result = fs.rwrite(&handle, *offset, &data.0).await;
            release(fids, fs, &handle).await;
            result.map(|count| Rwrite { count })
        }
        Tclunk { fid } => {
            let handle = acquire(fids, *fid).await?;
            let remove_on_close = {
                let st = handle.inner.lock().await;
                st.opened && omode::remove_on_clunk(st.mode)
            };
            if remove_on_close {
                let _ = fs.rremove(&handle).await;
            }
            release(fids, fs, &handle).await; // the ref we just took
            release(fids, fs, &handle).await; // the table's own ref
            Ok(Rclunk)
        }
        Tremove { fid } => {
            let handle = acquire(fids, *fid).await?;
            let result = fs.rremove(&handle).await;
            release(fids, fs, &handle).await;
            release(fids, fs, &handle).await;
            result.map(|_| Rremove)
        }
        Tstat { fid } => {
            let handle = acquire(fids, *fid).await?;
            let result = fs.rstat(&handle).await;
            release(fids, fs, &handle).await;
            result.map(|stat| Rstat { stat })
        }
        Twstat { fid, stat } => {
            let handle = acquire(fids, *fid).await?;
            let result = fs.rwstat(&handle, stat).await;
            release(fids, fs, &handle).await;
            result.map(|_| Rwstat)
        }
        _ => Err(Error::new(ErrCode::Badw9msg)),
    }
}

async fn serve_connection<Fs, R, W>(fs: Arc<Fs>, reader: R, writer: W)
where
    Fs: 'static + Filesystem,
    R: 'static + AsyncRead + Send + Unpin,
    W: 'static + AsyncWrite + Send + Unpin,
{
    fs.conn_opened().await;

    let fids: Arc<FidTable<Fs::Fid>> = Arc::new(Mutex::new(HashMap::new()));
    let reqs: Arc<ReqTable> = Arc::new(Mutex::new(HashMap::new()));
    let msize = Arc::new(AtomicU32::new(MSIZE));

    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .num_skip(0) // keep the size field in the yielded frame; our codec parses it itself
        .little_endian()
        .new_read(reader);
    let framedwrite = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_write(writer);
    let framedwrite = Arc::new(Mutex::new(framedwrite));

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
                error!("malformed message: {}", e);
                continue;
            }
        };
        debug!("\t<- {:?}", msg);

        // Version messages are handled inline, not spawned: every
        // concurrently-dispatched request must see either the old or the
        // new `msize`/fid table, never a torn mix of the two.
        if let FCall::Tversion { msize: client_msize, version } = &msg.body {
            clunk_all(&fids, &*fs).await;
            for (_, pending) in reqs.lock().await.iter_mut() {
                pending.status |= ReqStatus::FLUSH;
            }
            let response = match fs.rversion(*client_msize, version).await {
                Ok((negotiated, ver)) => {
                    msize.store(negotiated, Ordering::SeqCst);
                    framedread.decoder_mut().set_max_frame_length(negotiated as usize);
                    FCall::Rversion { msize: negotiated, version: ver }
                }
                Err(e) => FCall::Rerror { code: e.code, ename: e.msg },
            };
            send_reply(&framedwrite, msg.tag, response).await;
            continue;
        }

        if let FCall::Tflush { oldtag } = msg.body {
            let reqs = reqs.clone();
            let framedwrite = framedwrite.clone();
            let tag = msg.tag;
            tokio::spawn(async move {
                if let Some(reply) = handle_tflush(&reqs, tag, oldtag).await {
                    send_reply(&framedwrite, tag, reply).await;
                }
            });
            continue;
        }

        reqs.lock()
            .await
            .insert(msg.tag, PendingReq { status: ReqStatus::WORK, chasers: Vec::new() });

        let fs = fs.clone();
        let fids = fids.clone();
        let reqs = reqs.clone();
        let framedwrite = framedwrite.clone();
        let current_msize = msize.load(Ordering::SeqCst);

        tokio::spawn(async move {
            let tag = msg.tag;
            let response = match dispatch_once(&msg.body, &*fs, &fids, current_msize).await {
                Ok(r) => r,
                Err(e) => FCall::Rerror { code: e.code, ename: e.msg },
            };

            let chasers = {
                let mut guard = reqs.lock().await;
                match guard.remove(&tag) {
                    Some(p) => p.chasers,
                    None => Vec::new(),
                }
            };

            send_reply(&framedwrite, tag, response).await;
            for chaser in chasers {
                send_reply(&framedwrite, chaser, FCall::Rflush).await;
            }
        });
    }

    clunk_all(&fids, &*fs).await;
    fs.conn_closed().await;
}

async fn send_reply<W>(framedwrite: &Arc<Mutex<tokio_util::codec::FramedWrite<W, LengthDelimitedCodec>>>, tag: u16, body: FCall)
where
    W: AsyncWrite + Send + Unpin,
{
    let msg = Msg { tag, body };
    let bytes = match serialize::write_msg(&msg) {
        Ok(b) => b,
        Err(e) => {
            error!("failed to encode reply for tag {}: {}", tag, e);
            return;
        }
    };
    debug!("\t-> {:?}", msg);
    let mut frame = bytes::BytesMut::with_capacity(bytes.len());
    frame.put_slice(&bytes[4..]); // LengthDelimitedCodec re-adds the size prefix
    let mut w = framedwrite.lock().await;
    if let Err(e) = w.send(frame.freeze()).await {
        error!("failed to send reply for tag {}: {}", tag, e);
    }
}

async fn srv_tcp<Fs>(fs: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    let listener = TcpListener::bind(addr).await.map_err(Error::from)?;
    let fs = Arc::new(fs);

    loop {
        let (stream, peer) = listener.accept().await.map_err(Error::from)?;
        info!("accepted: {:?}", peer);
        let fs = fs.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            serve_connection(fs, readhalf, writehalf).await;
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;
    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

async fn srv_unix<Fs>(fs: Fs, addr: impl AsRef<Path>) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    let listener = DeleteOnDrop::bind(addr).map_err(Error::from)?;
    let fs = Arc::new(fs);

    loop {
        let (stream, peer) = listener.accept().await.map_err(Error::from)?;
        info!("accepted: {:?}", peer);
        let fs = fs.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = tokio::io::split(stream);
            serve_connection(fs, readhalf, writehalf).await;
        });
    }
}

/// Serves `fs` on `addr`, of the form `"tcp!host!port"` or `"unix!path!0"`
/// (the trailing field is ignored for unix sockets, kept for symmetry with
/// the reference dial string).
pub async fn serve<Fs>(fs: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    let (proto, host, port) = crate::utils::parse_proto(addr).ok_or_else(Error::einval)?;
    match proto {
        "tcp" => srv_tcp(fs, &format!("{}:{}", host, port)).await,
        "unix" => srv_unix(fs, host).await,
        _ => Err(Error::einval()),
    }
}
