//! Object toolkit: a small set of ready-made `Item`/`Directory`
//! implementations for building an object tree without hand-writing a
//! `srv::Filesystem` from scratch, plus an adapter that serves one.
//!
//! Grounded in `original_source/wkit/{baseitem,item,directory,bytes,digest,
//! events,dirmount,srv,srvobj}.go`: `BaseItem` becomes the shared fields
//! every concrete item embeds, `DirItem` the map-based directory,
//! `BytesItem`/`DigestItem`/`EventItem` the read-only specialty objects,
//! `MountPoint` the remote-forwarding proxy directory, and `ObjectTree`
//! the `ServerController`-style bridge from `srv::Filesystem` onto this
//! trait-object model.

use crate::error::{Error, ErrCode, Result};
use crate::fcall::{Dir, DirMode, Qid, QidType};
use crate::identity;
use crate::srv;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as SyncRwLock, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::sync::mpsc;

static NEXT_QID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next server-wide unique QID path.
pub fn next_qid_path() -> u64 {
    NEXT_QID.fetch_add(1, Ordering::Relaxed)
}

/// A single served object: file, directory, or specialty object. Mirrors
/// the reference `Item` interface one-for-one.
#[async_trait]
pub trait Item: Send + Sync {
    fn qid(&self) -> Qid;
    fn name(&self) -> String;
    fn mode(&self) -> u32;
    fn parent(&self) -> Option<Arc<dyn Directory>>;
    fn set_parent(&self, parent: Arc<dyn Directory>);

    /// Produces the handle a walk onto this item should return. Most items
    /// return themselves; `EventItem` clones a fresh subscription instead.
    async fn walked(self: Arc<Self>) -> Arc<dyn Item>;

    /// Returns `Some(self)` when this item is also a `Directory`. Lets the
    /// walk algorithm descend without downcasting.
    fn as_directory(self: Arc<Self>) -> Option<Arc<dyn Directory>> {
        None
    }

    async fn open(&self, _mode: u8) -> Result<()> {
        Ok(())
    }
    async fn read(&self, _offset: u64, _count: u32) -> Result<Vec<u8>> {
        Err(Error::new(ErrCode::Notopen))
    }
    async fn write(&self, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(Error::new(ErrCode::Notopen))
    }
    async fn clunk(&self) {}
    async fn remove(&self) -> Result<()> {
        Err(Error::new(ErrCode::Notimpl))
    }
    async fn stat(&self) -> Result<Dir>;
    async fn wstat(&self, _stat: &Dir) -> Result<()> {
        Err(Error::new(ErrCode::Notimpl))
    }
}

/// A directory: an `Item` that also holds named children.
#[async_trait]
pub trait Directory: Item {
    async fn walk(&self, name: &str) -> Result<Arc<dyn Item>>;
    async fn add_item(&self, item: Arc<dyn Item>);
    async fn remove_item(&self, name: &str) -> Result<()>;
    async fn children(&self) -> Vec<Arc<dyn Item>>;

    /// Upcasts to this directory's `Item` view. Needed because a trait
    /// object can't upcast across a supertrait boundary on its own;
    /// object-safe via the same `Arc<Self>` receiver pattern as
    /// [`Item::as_directory`].
    fn as_item(self: Arc<Self>) -> Arc<dyn Item>;
}

fn default_stat(qid: Qid, mode: u32, name: &str, length: u64) -> Dir {
    Dir {
        qid,
        mode,
        atime: 0,
        mtime: 0,
        length,
        name: name.to_owned(),
        uid: 0,
        gid: 0,
        muid: 0,
    }
}

/// Common fields every concrete item embeds, matching the reference
/// `BaseItem`.
pub struct BaseItem {
    name: SyncRwLock<String>,
    qid: Qid,
    mode: AtomicU64,
    parent: SyncRwLock<Option<Weak<dyn Directory>>>,
}

impl BaseItem {
    pub fn new(name: impl Into<String>, is_dir: bool) -> Self {
        let typ = if is_dir { QidType::DIR } else { QidType::empty() };
        let mut mode: u32 = 0o644;
        if is_dir {
            mode |= DirMode::DMDIR.bits() | 0o111;
        }
        BaseItem {
            name: SyncRwLock::new(name.into()),
            qid: Qid { typ, version: 0, path: next_qid_path() },
            mode: AtomicU64::new(mode as u64),
            parent: SyncRwLock::new(None),
        }
    }

    fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    fn qid(&self) -> Qid {
        self.qid
    }

    fn mode(&self) -> u32 {
        self.mode.load(Ordering::Relaxed) as u32
    }

    fn parent(&self) -> Option<Arc<dyn Directory>> {
        self.parent.read().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn set_parent(&self, parent: Arc<dyn Directory>) {
        *self.parent.write().unwrap() = Some(Arc::downgrade(&parent));
    }

    /// Builds a `BaseItem` around a QID the caller already holds (e.g. one
    /// returned by a remote walk), rather than minting a fresh local one.
    fn with_qid(name: impl Into<String>, qid: Qid, mode: u32) -> Self {
        BaseItem {
            name: SyncRwLock::new(name.into()),
            qid,
            mode: AtomicU64::new(mode as u64),
            parent: SyncRwLock::new(None),
        }
    }
}

/// A byte buffer with Plan-9-style append/truncate/zero-extend write
/// semantics, matching the reference `OneItem`.
pub struct PlainItem {
    base: BaseItem,
    buf: RwLock<Vec<u8>>,
}

impl PlainItem {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(PlainItem { base: BaseItem::new(name, false), buf: RwLock::new(Vec::new()) })
    }
}

#[async_trait]
impl Item for PlainItem {
    fn qid(&self) -> Qid {
        self.base.qid()
    }
    fn name(&self) -> String {
        self.base.name()
    }
    fn mode(&self) -> u32 {
        self.base.mode()
    }
    fn parent(&self) -> Option<Arc<dyn Directory>> {
        self.base.parent()
    }
    fn set_parent(&self, parent: Arc<dyn Directory>) {
        self.base.set_parent(parent)
    }
    async fn walked(self: Arc<Self>) -> Arc<dyn Item> {
        self
    }
    async fn read(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        let buf = self.buf.read().await;
        let offset = offset as usize;
        if offset >= buf.len() {
            return Ok(Vec::new());
        }
        let end = (offset + count as usize).min(buf.len());
        Ok(buf[offset..end].to_vec())
    }
    async fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let mut buf = self.buf.write().await;
        let offset = offset as usize;
        let append = DirMode::from_bits_truncate(self.base.mode()).contains(DirMode::DMAPPEND);
        if append || offset == buf.len() {
            buf.extend_from_slice(data);
        } else if offset < buf.len() {
            buf.truncate(offset);
            buf.extend_from_slice(data);
        } else {
            buf.resize(offset, 0);
            buf.extend_from_slice(data);
        }
        Ok(data.len() as u32)
    }
    async fn stat(&self) -> Result<Dir> {
        let len = self.buf.read().await.len() as u64;
        Ok(default_stat(self.base.qid(), self.base.mode(), &self.base.name(), len))
    }
}

/// A sequence of bytes recomputed on every read, matching the reference
/// `BytesSequence`/`BytesItem` pair (e.g. a version string, a config dump).
pub trait BytesSequence: Send + Sync {
    fn bytes(&self) -> Vec<u8>;
}

pub struct BytesItem {
    base: BaseItem,
    source: Arc<dyn BytesSequence>,
}

impl BytesItem {
    pub fn new(name: impl Into<String>, source: Arc<dyn BytesSequence>) -> Arc<Self> {
        Arc::new(BytesItem { base: BaseItem::new(name, false), source })
    }
}

#[async_trait]
impl Item for BytesItem {
    fn qid(&self) -> Qid {
        self.base.qid()
    }
    fn name(&self) -> String {
        self.base.name()
    }
    fn mode(&self) -> u32 {
        self.base.mode()
    }
    fn parent(&self) -> Option<Arc<dyn Directory>> {
        self.base.parent()
    }
    fn set_parent(&self, parent: Arc<dyn Directory>) {
        self.base.set_parent(parent)
    }
    async fn walked(self: Arc<Self>) -> Arc<dyn Item> {
        self
    }
    async fn read(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        if offset > 0 {
            return Ok(Vec::new());
        }
        let bytes = self.source.bytes();
        if (count as usize) < bytes.len() {
            return Err(Error::new(ErrCode::Bufsz));
        }
        Ok(bytes)
    }
    async fn stat(&self) -> Result<Dir> {
        let len = self.source.bytes().len() as u64;
        Ok(default_stat(self.base.qid(), self.base.mode(), &self.base.name(), len))
    }
}

/// A running 32-bit checksum, matching the reference `Digest32`/`DigestItem`
/// pair: each read reports the digest of everything written so far, as a
/// little-endian 4-byte value.
pub trait Digest32: Send + Sync {
    fn sum32(&self) -> u32;
    fn write(&self, data: &[u8]);
}

pub struct DigestItem {
    base: BaseItem,
    hash: Arc<dyn Digest32>,
}

impl DigestItem {
    pub fn new(name: impl Into<String>, hash: Arc<dyn Digest32>) -> Arc<Self> {
        Arc::new(DigestItem { base: BaseItem::new(name, false), hash })
    }
}

#[async_trait]
impl Item for DigestItem {
    fn qid(&self) -> Qid {
        self.base.qid()
    }
    fn name(&self) -> String {
        self.base.name()
    }
    fn mode(&self) -> u32 {
        self.base.mode()
    }
    fn parent(&self) -> Option<Arc<dyn Directory>> {
        self.base.parent()
    }
    fn set_parent(&self, parent: Arc<dyn Directory>) {
        self.base.set_parent(parent)
    }
    async fn walked(self: Arc<Self>) -> Arc<dyn Item> {
        self
    }
    async fn read(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        if offset > 0 {
            return Ok(Vec::new());
        }
        if count < 4 {
            return Err(Error::new(ErrCode::Bufsz));
        }
        Ok(self.hash.sum32().to_le_bytes().to_vec())
    }
    async fn write(&self, _offset: u64, data: &[u8]) -> Result<u32> {
        self.hash.write(data);
        Ok(data.len() as u32)
    }
    async fn stat(&self) -> Result<Dir> {
        Ok(default_stat(self.base.qid(), self.base.mode(), &self.base.name(), 4))
    }
}

type Event = Vec<u8>;

/// A subscriber's event queue plus an explicit close signal, matching the
/// reference `subscriptionType`'s `readCh`/`closeCh` pair: closing is a
/// signal a blocked reader observes, not something inferred from the
/// channel being dropped (the reader itself holds a strong reference to
/// this subscription for the duration of the call, so a drop-based signal
/// could never fire while the read is in flight). `wake` is pulsed by
/// both a new publish and a clunk, mirroring `readCh`/`closeCh` feeding
/// the same `select`.
struct Subscription {
    tx: mpsc::Sender<Event>,
    rx: Mutex<mpsc::Receiver<Event>>,
    closed: std::sync::atomic::AtomicBool,
    wake: tokio::sync::Notify,
}

/// A broadcast channel presented as a file: every walk onto it opens a
/// fresh subscription, and every write to the primordial handle fans the
/// event out to every live subscriber. Matches the reference `EventItem`.
pub struct EventItem {
    base: BaseItem,
    /// Shared between the primordial item and every subscription cloned
    /// from it via `walked`, so a subscriber can unregister itself on
    /// clunk without needing to look itself up through a parent directory.
    subscribers: Arc<SyncRwLock<Vec<Arc<Subscription>>>>,
    /// `None` on the primordial item; `Some` on a per-walk subscription.
    subscription: Option<Arc<Subscription>>,
}

impl EventItem {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(EventItem {
            base: BaseItem::new(name, false),
            subscribers: Arc::new(SyncRwLock::new(Vec::new())),
            subscription: None,
        })
    }

    /// Publishes `event` to every currently-subscribed reader. Non-blocking:
    /// a subscriber whose queue is full misses the event rather than
    /// stalling the publisher.
    pub fn publish(&self, event: Event) {
        let subs = self.subscribers.read().unwrap();
        for sub in subs.iter() {
            let _ = sub.tx.try_send(event.clone());
            sub.wake.notify_waiters();
        }
    }
}

#[async_trait]
impl Item for EventItem {
    fn qid(&self) -> Qid {
        self.base.qid()
    }
    fn name(&self) -> String {
        self.base.name()
    }
    fn mode(&self) -> u32 {
        self.base.mode()
    }
    fn parent(&self) -> Option<Arc<dyn Directory>> {
        self.base.parent()
    }
    fn set_parent(&self, parent: Arc<dyn Directory>) {
        self.base.set_parent(parent)
    }

    async fn walked(self: Arc<Self>) -> Arc<dyn Item> {
        let (tx, rx) = mpsc::channel(64);
        let sub = Arc::new(Subscription {
            tx,
            rx: Mutex::new(rx),
            closed: std::sync::atomic::AtomicBool::new(false),
            wake: tokio::sync::Notify::new(),
        });
        self.subscribers.write().unwrap().push(sub.clone());
        Arc::new(EventItem {
            base: BaseItem::new(self.base.name(), false),
            subscribers: self.subscribers.clone(),
            subscription: Some(sub),
        })
    }

    /// Blocks for the next event, or returns `Eof` once this subscription
    /// has been clunked — checked explicitly rather than inferred from
    /// channel closure, since the in-flight read itself keeps the
    /// subscription (and its sender) alive.
    async fn read(&self, _offset: u64, _count: u32) -> Result<Vec<u8>> {
        let sub = self.subscription.as_ref().ok_or_else(Error::notopen)?;
        loop {
            // Snapshot the notification before checking state, so a wake
            // pulsed between the check and the `.await` below is not lost.
            let woken = sub.wake.notified();
            {
                let mut rx = sub.rx.lock().await;
                if let Ok(event) = rx.try_recv() {
                    return Ok(event);
                }
            }
            if sub.closed.load(Ordering::Acquire) {
                return Err(Error::eof());
            }
            woken.await;
        }
    }

    async fn write(&self, _offset: u64, data: &[u8]) -> Result<u32> {
        self.publish(data.to_vec());
        Ok(data.len() as u32)
    }

    async fn clunk(&self) {
        if let Some(sub) = &self.subscription {
            self.subscribers.write().unwrap().retain(|s| !Arc::ptr_eq(s, sub));
            sub.closed.store(true, Ordering::Release);
            sub.wake.notify_waiters();
        }
    }

    async fn stat(&self) -> Result<Dir> {
        Ok(default_stat(self.base.qid(), self.base.mode(), &self.base.name(), 0))
    }
}

/// A map-based directory, matching the reference `DirItem`.
pub struct DirItem {
    base: BaseItem,
    children: RwLock<HashMap<String, Arc<dyn Item>>>,
}

impl DirItem {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(DirItem { base: BaseItem::new(name, true), children: RwLock::new(HashMap::new()) })
    }

    /// Builds a root directory: its own parent, so that `..` from root
    /// stays at root instead of erroring.
    pub fn new_root(name: impl Into<String>) -> Arc<Self> {
        let root = DirItem::new(name);
        root.set_parent(root.clone());
        root
    }
}

#[async_trait]
impl Item for DirItem {
    fn qid(&self) -> Qid {
        self.base.qid()
    }
    fn name(&self) -> String {
        self.base.name()
    }
    fn mode(&self) -> u32 {
        self.base.mode()
    }
    fn parent(&self) -> Option<Arc<dyn Directory>> {
        self.base.parent()
    }
    fn set_parent(&self, parent: Arc<dyn Directory>) {
        self.base.set_parent(parent)
    }
    async fn walked(self: Arc<Self>) -> Arc<dyn Item> {
        self
    }
    fn as_directory(self: Arc<Self>) -> Option<Arc<dyn Directory>> {
        Some(self)
    }

    /// Serializes one page of directory entries starting at `offset`,
    /// which must equal the cumulative byte count of all prior reads on
    /// this fid (enforced by the server engine, not here).
    async fn read(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        let children = self.children.read().await;
        let mut names: Vec<&String> = children.keys().collect();
        names.sort();

        let mut all = Vec::new();
        for name in names.drain(..) {
            let item = &children[name];
            let stat = item.stat().await?;
            stat.encode(&mut all).map_err(|_| Error::new(ErrCode::Bufsz))?;
        }

        let offset = offset as usize;
        if offset > all.len() {
            return Err(Error::new(ErrCode::Badoffset));
        }
        let end = (offset + count as usize).min(all.len());
        Ok(all[offset..end].to_vec())
    }

    async fn stat(&self) -> Result<Dir> {
        Ok(default_stat(self.base.qid(), self.base.mode(), &self.base.name(), 0))
    }
}

#[async_trait]
impl Directory for DirItem {
    async fn walk(&self, name: &str) -> Result<Arc<dyn Item>> {
        if name == ".." {
            let parent = self.parent().ok_or_else(Error::noent)?;
            return Ok(parent.as_item().walked().await);
        }
        let item = self.children.read().await.get(name).cloned().ok_or_else(Error::noent)?;
        Ok(item.walked().await)
    }

    async fn add_item(&self, item: Arc<dyn Item>) {
        let name = item.name();
        self.children.write().await.insert(name, item);
    }

    async fn remove_item(&self, name: &str) -> Result<()> {
        self.children.write().await.remove(name).map(|_| ()).ok_or_else(Error::noent)
    }

    async fn children(&self) -> Vec<Arc<dyn Item>> {
        self.children.read().await.values().cloned().collect()
    }

    fn as_item(self: Arc<Self>) -> Arc<dyn Item> {
        self
    }
}

impl DirItem {
    /// Adds `item` as a child and wires up its parent pointer in one step.
    /// `add_item` alone (from the `Directory` trait) leaves linking the
    /// parent to the caller, matching the reference implementation.
    pub async fn insert(self: &Arc<Self>, item: Arc<dyn Item>) {
        item.set_parent(self.clone());
        self.add_item(item).await;
    }
}

/// A directory-shaped object whose every operation forwards through an
/// owned Warp9 client to a remote server, matching the reference
/// `MountPoint`. `walk` calls the remote's walk and wraps the resulting
/// fid in a new mount-point clone; the other operations translate
/// one-for-one onto the client's per-fid RPCs.
pub struct MountPoint {
    base: BaseItem,
    client: crate::clnt::Client,
    fid: Mutex<Option<crate::clnt::Fid>>,
}

impl MountPoint {
    /// Dials `addr`, attaches to `aname` as `uid`, and returns a mount
    /// point rooted at the remote attach point. `msize` is clamped to
    /// `max(IOHDRSZ, requested)`, matching `MountPointDial`; `0` requests
    /// the library default.
    pub async fn dial(addr: &str, aname: &str, msize: u32, uid: u32) -> Result<Arc<Self>> {
        let msize = if msize == 0 {
            crate::fcall::MSIZE
        } else {
            msize.max(crate::fcall::IOHDRSZ)
        };
        let (client, root_fid) = crate::clnt::mount(addr, msize, uid, aname).await?;
        let qid = root_fid.qid();
        Ok(Arc::new(MountPoint {
            base: BaseItem::with_qid(aname, qid, mount_mode(qid)),
            client,
            fid: Mutex::new(Some(root_fid)),
        }))
    }

    async fn remote(&self) -> Result<crate::clnt::Fid> {
        self.fid.lock().await.clone().ok_or_else(|| Error::new(ErrCode::Fidnil))
    }
}

fn mount_mode(qid: Qid) -> u32 {
    let mut mode: u32 = 0o644;
    if qid.typ.contains(QidType::DIR) {
        mode |= DirMode::DMDIR.bits() | 0o111;
    }
    mode
}

#[async_trait]
impl Item for MountPoint {
    fn qid(&self) -> Qid {
        self.base.qid()
    }
    fn name(&self) -> String {
        self.base.name()
    }
    fn mode(&self) -> u32 {
        self.base.mode()
    }
    fn parent(&self) -> Option<Arc<dyn Directory>> {
        self.base.parent()
    }
    fn set_parent(&self, parent: Arc<dyn Directory>) {
        self.base.set_parent(parent)
    }
    async fn walked(self: Arc<Self>) -> Arc<dyn Item> {
        self
    }
    fn as_directory(self: Arc<Self>) -> Option<Arc<dyn Directory>> {
        if self.base.qid().typ.contains(QidType::DIR) { Some(self) } else { None }
    }
    async fn open(&self, mode: u8) -> Result<()> {
        let mut guard = self.fid.lock().await;
        let fid = guard.as_mut().ok_or_else(|| Error::new(ErrCode::Fidnil))?;
        fid.open(mode).await.map(|_iounit| ())
    }
    async fn read(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        self.remote().await?.read(offset, count).await
    }
    async fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        self.remote().await?.write(offset, data).await
    }
    async fn clunk(&self) {
        if let Some(fid) = self.fid.lock().await.take() {
            let _ = fid.clunk().await;
        }
    }
    async fn remove(&self) -> Result<()> {
        let fid = self.fid.lock().await.take().ok_or_else(|| Error::new(ErrCode::Fidnil))?;
        fid.remove().await
    }
    async fn stat(&self) -> Result<Dir> {
        self.remote().await?.stat().await
    }
    async fn wstat(&self, stat: &Dir) -> Result<()> {
        self.remote().await?.wstat(stat.clone()).await
    }
}

#[async_trait]
impl Directory for MountPoint {
    async fn walk(&self, name: &str) -> Result<Arc<dyn Item>> {
        let fid = self.remote().await?;
        let newfid = fid.walk(std::slice::from_ref(&name.to_string())).await?;
        let qid = newfid.qid();
        Ok(Arc::new(MountPoint {
            base: BaseItem::with_qid(name, qid, mount_mode(qid)),
            client: self.client.clone(),
            fid: Mutex::new(Some(newfid)),
        }))
    }

    /// A mount point is a proxy to another namespace; it does not allow
    /// items to be attached locally, matching the reference `AddItem`.
    async fn add_item(&self, _item: Arc<dyn Item>) {}

    async fn remove_item(&self, _name: &str) -> Result<()> {
        Err(Error::new(ErrCode::Notimpl))
    }

    async fn children(&self) -> Vec<Arc<dyn Item>> {
        Vec::new()
    }

    fn as_item(self: Arc<Self>) -> Arc<dyn Item> {
        self
    }
}

use crate::serialize::Encodable;

/// Bridges the object-toolkit trait-object model onto `srv::Filesystem`,
/// matching the reference `srvobj.go`'s `ServerController`.
pub struct ObjectTree {
    root: Arc<dyn Directory>,
}

impl ObjectTree {
    pub fn new(root: Arc<dyn Directory>) -> Self {
        ObjectTree { root }
    }
}

/// Per-fid state: the object a fid currently names, if any. `None` only
/// between a fid's allocation and the attach/walk call that populates it.
pub type FidSlot = Option<Arc<dyn Item>>;

#[async_trait]
impl srv::Filesystem for ObjectTree {
    type Fid = FidSlot;

    async fn rattach(
        &self,
        fid: &srv::Fid<Self::Fid>,
        afid: Option<&srv::Fid<Self::Fid>>,
        uid: u32,
        _aname: &str,
    ) -> Result<Qid> {
        if afid.is_some() {
            return Err(Error::new(ErrCode::Noauth));
        }
        let _ = identity::user(uid);
        let item: Arc<dyn Item> = self.root.clone();
        let qid = item.qid();
        fid.set_aux(Some(item)).await;
        Ok(qid)
    }

    async fn rwalk(&self, fid: &srv::Fid<Self::Fid>, newfid: &srv::Fid<Self::Fid>, wname: &[String]) -> Result<Qid> {
        let mut cur = fid.aux().await.ok_or_else(Error::fidnoaux)?;
        for name in wname {
            let dir = cur.clone().as_directory().ok_or_else(Error::notdir)?;
            cur = dir.walk(name).await?;
        }
        let qid = cur.qid();
        newfid.set_aux(Some(cur)).await;
        Ok(qid)
    }

    async fn ropen(&self, fid: &srv::Fid<Self::Fid>, mode: u8) -> Result<(Qid, u32)> {
        let item = fid.aux().await.ok_or_else(Error::fidnoaux)?;
        item.open(mode).await?;
        Ok((item.qid(), 0))
    }

    async fn rread(&self, fid: &srv::Fid<Self::Fid>, offset: u64, count: u32) -> Result<Vec<u8>> {
        let item = fid.aux().await.ok_or_else(Error::fidnoaux)?;
        item.read(offset, count).await
    }

    async fn rwrite(&self, fid: &srv::Fid<Self::Fid>, offset: u64, data: &[u8]) -> Result<u32> {
        let item = fid.aux().await.ok_or_else(Error::fidnoaux)?;
        item.write(offset, data).await
    }

    async fn rremove(&self, fid: &srv::Fid<Self::Fid>) -> Result<()> {
        let item = fid.aux().await.ok_or_else(Error::fidnoaux)?;
        item.remove().await?;
        if let Some(parent) = item.parent() {
            parent.remove_item(&item.name()).await?;
        }
        Ok(())
    }

    async fn rstat(&self, fid: &srv::Fid<Self::Fid>) -> Result<Dir> {
        let item = fid.aux().await.ok_or_else(Error::fidnoaux)?;
        item.stat().await
    }

    async fn rwstat(&self, fid: &srv::Fid<Self::Fid>, stat: &Dir) -> Result<()> {
        let item = fid.aux().await.ok_or_else(Error::fidnoaux)?;
        item.wstat(stat).await
    }

    async fn fid_destroy(&self, aux: &Self::Fid) {
        if let Some(item) = aux {
            item.clunk().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_item_write_then_read_roundtrips() {
        let item = PlainItem::new("greeting");
        item.write(0, b"hello").await.unwrap();
        let data = item.read(0, 5).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn plain_item_write_past_end_zero_fills() {
        let item = PlainItem::new("sparse");
        item.write(4, b"x").await.unwrap();
        let data = item.read(0, 5).await.unwrap();
        assert_eq!(data, vec![0, 0, 0, 0, b'x']);
    }

    struct Fixed(&'static [u8]);
    impl BytesSequence for Fixed {
        fn bytes(&self) -> Vec<u8> {
            self.0.to_vec()
        }
    }

    #[tokio::test]
    async fn bytes_item_eof_past_offset_zero() {
        let item = BytesItem::new("version", Arc::new(Fixed(b"W90.0")));
        assert_eq!(item.read(0, 16).await.unwrap(), b"W90.0");
        assert_eq!(item.read(1, 16).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn plain_item_write_within_length_truncates_tail() {
        let item = PlainItem::new("doc");
        item.write(0, b"hello world").await.unwrap();
        // offset within the current length discards everything from
        // offset onward before appending, it does not overwrite in place.
        item.write(5, b"!!").await.unwrap();
        assert_eq!(item.read(0, 16).await.unwrap(), b"hello!!");
        assert_eq!(item.stat().await.unwrap().length, 7);
    }

    #[tokio::test]
    async fn plain_item_append_mode_ignores_offset() {
        let item = PlainItem::new("log");
        item.write(0, b"first ").await.unwrap();
        item.base.mode.store(
            (item.base.mode() as u64) | DirMode::DMAPPEND.bits() as u64,
            Ordering::Relaxed,
        );
        item.write(0, b"second").await.unwrap();
        assert_eq!(item.read(0, 16).await.unwrap(), b"first second");
    }

    struct RunningSum(std::sync::atomic::AtomicU32);
    impl Digest32 for RunningSum {
        fn sum32(&self) -> u32 {
            self.0.load(Ordering::Relaxed)
        }
        fn write(&self, data: &[u8]) {
            for &b in data {
                self.0.fetch_add(b as u32, Ordering::Relaxed);
            }
        }
    }

    #[tokio::test]
    async fn digest_item_reports_running_sum_little_endian() {
        let item = DigestItem::new("sum", Arc::new(RunningSum(std::sync::atomic::AtomicU32::new(0))));
        item.write(0, b"ab").await.unwrap();
        let expected = (b'a' as u32 + b'b' as u32).to_le_bytes().to_vec();
        assert_eq!(item.read(0, 4).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn digest_item_read_rejects_undersized_buffer() {
        let item = DigestItem::new("sum", Arc::new(RunningSum(std::sync::atomic::AtomicU32::new(0))));
        let err = item.read(0, 2).await.unwrap_err();
        assert_eq!(err.code, ErrCode::Bufsz as i16);
    }

    #[tokio::test]
    async fn event_item_broadcasts_to_every_subscriber() {
        let primordial = EventItem::new("events");
        let sub1 = primordial.clone().walked().await;
        let sub2 = primordial.clone().walked().await;

        primordial.publish(b"ping".to_vec());

        assert_eq!(sub1.read(0, 0).await.unwrap(), b"ping");
        assert_eq!(sub2.read(0, 0).await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn event_item_clunk_unblocks_waiting_reader_with_eof() {
        let primordial = EventItem::new("events");
        let sub = primordial.clone().walked().await;
        let sub_clunk = sub.clone();

        let reader = tokio::spawn(async move { sub.read(0, 0).await });
        // give the reader a chance to actually start blocking on the
        // empty queue before we clunk it.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        sub_clunk.clunk().await;

        let result = reader.await.unwrap();
        assert_eq!(result.unwrap_err().code, ErrCode::Eof as i16);
    }

    #[tokio::test]
    async fn dotdot_resolves_to_parent_and_root_self_parents() {
        let root = DirItem::new_root("/");
        let child = DirItem::new("sub");
        root.insert(child.clone()).await;

        let up_from_child = child.walk("..").await.unwrap();
        assert_eq!(up_from_child.qid(), root.qid());

        let up_from_root = root.walk("..").await.unwrap();
        assert_eq!(up_from_root.qid(), root.qid());
    }

    #[tokio::test]
    async fn dir_walk_missing_component_is_noent() {
        let root = DirItem::new_root("/");
        let err = root.walk("nope").await.unwrap_err();
        assert_eq!(err.code, ErrCode::Noent as i16);
    }
}
