//! Filesystem facade
//!
//! Translates kernel operations into local-first actions against the
//! engine. No operation performs network I/O synchronously: the only
//! awaits that can reach the remote are a first-time directory enumeration
//! and hydration on `open`, both of which run on the engine's worker pools
//! with the caller attached as a waiter.
//!
//! Bridging: fuser callbacks are synchronous. Pure-store operations run on
//! the runtime via `block_on`; anything that may wait on a queue or a
//! download is spawned with the reply moved into the task, so the kernel
//! dispatch thread is never parked on the network.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use graphfs_core::domain::{
    ChangeKind, ChangePayload, Item, ItemId, ItemState, MetadataEntry, MutationJob, OfflineChange,
    PinMode,
};
use graphfs_core::CoreError;
use graphfs_engine::{Engine, HydrationPriority};

use crate::error::FuseError;
use crate::inode::{write_lock, InodeTable, ROOT_INO};
use crate::xattr;

/// Kernel attribute-cache TTL.
const TTL: Duration = Duration::from_secs(1);

/// POSIX NAME_MAX.
const NAME_MAX: usize = 255;

const BLOCK_SIZE: u32 = 4096;

/// Open-handle record. `marked_dirty` makes the dirty transition
/// once-per-handle instead of once-per-write.
struct OpenHandle {
    id: ItemId,
    is_dir: bool,
    marked_dirty: bool,
}

/// Shared context cloned into spawned operation tasks.
#[derive(Clone)]
struct FsCtx {
    engine: Arc<Engine>,
    inodes: Arc<InodeTable>,
    handles: Arc<DashMap<u64, OpenHandle>>,
}

impl FsCtx {
    async fn entry_for_ino(&self, ino: u64) -> Result<(ItemId, MetadataEntry), FuseError> {
        let id = self.inodes.id_for(ino).ok_or(FuseError::StaleInode(ino))?;
        let entry = self
            .engine
            .state
            .store()
            .get(&id)
            .await
            .map_err(FuseError::Core)?
            .ok_or_else(|| FuseError::Core(CoreError::NotFound(format!("no entry for {id}"))))?;
        Ok((id, entry))
    }

    /// Build the kernel attribute record for an entry. Sizes of content-
    /// bearing entries come from the cache file, which is authoritative
    /// between uploads.
    fn attr(&self, entry: &MetadataEntry, ino: u64, uid: u32, gid: u32) -> FileAttr {
        let size = if entry.is_directory() {
            0
        } else {
            self.engine
                .cache
                .size_of(entry.id())
                .unwrap_or(entry.item().size)
        };
        let mtime = system_time(entry.item().mtime);
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: if entry.is_directory() {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: entry.item().mode as u16,
            nlink: if entry.is_directory() { 2 } else { 1 },
            uid,
            gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Resolve a child by name, fetching the enumeration first if this
    /// directory has never been listed.
    async fn resolve_child(
        &self,
        parent_id: &ItemId,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Option<MetadataEntry>, FuseError> {
        let store = self.engine.state.store();
        if let Some(child) = store.lookup_child(parent_id, name).await? {
            if child.state() == ItemState::Deleted {
                return Ok(None);
            }
            return Ok(Some(child));
        }
        if !store.has_enumerated(parent_id).await? && !self.engine.offline.is_offline() {
            self.engine.requests.list_children(parent_id, token).await?;
            if let Some(child) = store.lookup_child(parent_id, name).await? {
                if child.state() != ItemState::Deleted {
                    return Ok(Some(child));
                }
            }
        }
        Ok(None)
    }

    /// Make sure content is present for an open/truncate, hydrating in the
    /// foreground when it is not.
    async fn ensure_content(
        &self,
        id: &ItemId,
        token: &CancellationToken,
    ) -> Result<(), FuseError> {
        if self.engine.cache.has_content(id) {
            return Ok(());
        }
        let ticket = self
            .engine
            .hydration
            .queue(id, HydrationPriority::Foreground)
            .await?;
        ticket.wait(token).await?;
        Ok(())
    }

    /// Queue the remote half of a foreground mutation, or log it when
    /// offline. The offline record happens before the caller applies the
    /// local metadata change.
    async fn record_if_offline(
        &self,
        kind: ChangeKind,
        item_id: &ItemId,
        payload: ChangePayload,
    ) -> Result<bool, FuseError> {
        if !self.engine.offline.is_offline() {
            return Ok(false);
        }
        self.engine
            .offline
            .record(OfflineChange::new(kind, item_id.clone(), payload))
            .await?;
        Ok(true)
    }
}

fn system_time(dt: chrono::DateTime<chrono::Utc>) -> SystemTime {
    let secs = dt.timestamp();
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    }
}

fn valid_name(name: &OsStr) -> Result<String, FuseError> {
    let name = name
        .to_str()
        .ok_or_else(|| FuseError::InvalidName("non-UTF-8 name".into()))?;
    if name.len() > NAME_MAX || name.is_empty() || name.contains('/') {
        return Err(FuseError::InvalidName(name.to_string()));
    }
    Ok(name.to_string())
}

/// The mountable filesystem.
pub struct GraphFs {
    ctx: FsCtx,
    rt: Handle,
    next_fh: AtomicU64,
    uid: u32,
    gid: u32,
    shutdown: CancellationToken,
}

impl GraphFs {
    /// Build the facade over a started engine.
    ///
    /// Spawns the rekey follower that keeps inode numbers and open handles
    /// attached to entries whose `local-*` id is replaced.
    pub fn new(engine: Arc<Engine>, rt: Handle, shutdown: CancellationToken) -> Self {
        let inodes = Arc::new(InodeTable::new(engine.root_id().clone()));
        let handles: Arc<DashMap<u64, OpenHandle>> = Arc::new(DashMap::new());

        {
            let mut rekeys = engine.state.subscribe_rekeys();
            let inodes = Arc::clone(&inodes);
            let handles = Arc::clone(&handles);
            let shutdown = shutdown.clone();
            rt.spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = rekeys.recv() => event,
                    };
                    match event {
                        Ok(event) => {
                            inodes.rekey(&event.old_id, &event.new_id);
                            for mut handle in handles.iter_mut() {
                                if handle.id == event.old_id {
                                    handle.id = event.new_id.clone();
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
            });
        }

        // SAFETY-free libc calls: real uid/gid of the mounting process.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };

        Self {
            ctx: FsCtx {
                engine,
                inodes,
                handles,
            },
            rt,
            next_fh: AtomicU64::new(1),
            uid,
            gid,
            shutdown,
        }
    }

    /// Recommended mount options.
    pub fn mount_options(name: &str) -> Vec<fuser::MountOption> {
        vec![
            fuser::MountOption::FSName(name.to_string()),
            fuser::MountOption::DefaultPermissions,
            fuser::MountOption::NoAtime,
        ]
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn op_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}

impl Filesystem for GraphFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match valid_name(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.errno()),
        };
        let ctx = self.ctx.clone();
        let (uid, gid) = (self.uid, self.gid);
        let token = self.op_token();
        self.rt.spawn(async move {
            let result: Result<(u64, FileAttr), FuseError> = async {
                let parent_id = ctx
                    .inodes
                    .id_for(parent)
                    .ok_or(FuseError::StaleInode(parent))?;
                let child = ctx
                    .resolve_child(&parent_id, &name, &token)
                    .await?
                    .ok_or_else(|| {
                        FuseError::Core(CoreError::NotFound(format!("{name} not in {parent_id}")))
                    })?;
                let ino = ctx.inodes.ino_for(child.id());
                Ok((ino, ctx.attr(&child, ino, uid, gid)))
            }
            .await;
            match result {
                Ok((_, attr)) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let ctx = self.ctx.clone();
        let (uid, gid) = (self.uid, self.gid);
        match self.rt.block_on(ctx.entry_for_ino(ino)) {
            Ok((_, entry)) => reply.attr(&TTL, &ctx.attr(&entry, ino, uid, gid)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let ctx = self.ctx.clone();
        let (uid, gid) = (self.uid, self.gid);
        let token = self.op_token();
        self.rt.spawn(async move {
            let result: Result<FileAttr, FuseError> = async {
                let (id, entry) = ctx.entry_for_ino(ino).await?;
                if entry.is_virtual() {
                    return Err(FuseError::Core(CoreError::Permission(
                        "virtual entries are read-only".into(),
                    )));
                }

                if let Some(new_size) = size {
                    if entry.is_directory() {
                        return Err(FuseError::IsDirectory);
                    }
                    // Record the truncate intent under the inode lock, then
                    // release it for the file I/O and re-check afterwards.
                    {
                        let lock = ctx.inodes.lock_arc(ino);
                        let _guard = write_lock(&lock);
                    }
                    if new_size == 0 && !ctx.engine.cache.has_content(&id) {
                        ctx.engine.cache.insert(&id, b"")?;
                    } else {
                        ctx.ensure_content(&id, &token).await?;
                    }
                    ctx.engine.cache.truncate(&id, new_size)?;
                    // Briefly re-lock around the size re-read; the dirty
                    // transition itself is linearized by the state manager.
                    {
                        let lock = ctx.inodes.lock_arc(ino);
                        let _guard = write_lock(&lock);
                        let _ = ctx.engine.cache.size_of(&id);
                    }
                    ctx.engine.state.mark_dirty(&id).await?;
                }

                if let Some(when) = mtime {
                    let when = match when {
                        TimeOrNow::SpecificTime(t) => t,
                        TimeOrNow::Now => SystemTime::now(),
                    };
                    let stamp = chrono::DateTime::<chrono::Utc>::from(when);
                    ctx.engine.state.set_mtime(&id, stamp).await?;
                }

                let (_, entry) = ctx.entry_for_ino(ino).await?;
                Ok(ctx.attr(&entry, ino, uid, gid))
            }
            .await;
            match result {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let ctx = self.ctx.clone();
        match self.rt.block_on(ctx.entry_for_ino(ino)) {
            Ok((id, entry)) if entry.is_directory() => {
                // Warm the listing; a cold readdir right after dedups onto
                // this request instead of issuing a second fetch.
                if !ctx.engine.offline.is_offline() {
                    ctx.engine.requests.warm(&id);
                }
                let fh = self.alloc_fh();
                self.ctx.handles.insert(
                    fh,
                    OpenHandle {
                        id,
                        is_dir: true,
                        marked_dirty: false,
                    },
                );
                reply.opened(fh, 0);
            }
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.ctx.handles.remove(&fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let ctx = self.ctx.clone();
        let token = self.op_token();
        self.rt.spawn(async move {
            let result: Result<(), FuseError> = async {
                let (dir_id, entry) = ctx.entry_for_ino(ino).await?;
                if !entry.is_directory() {
                    return Err(FuseError::NotDirectory);
                }

                // Snapshot the child list (stale-serve plus async refresh),
                // then resolve inodes without holding anything.
                let children = ctx.engine.requests.list_children(&dir_id, &token).await?;

                let mut index = 0i64;
                let mut emit = |ino: u64, kind: FileType, name: &str| -> bool {
                    index += 1;
                    if index <= offset {
                        return false;
                    }
                    reply.add(ino, index, kind, name)
                };

                let parent_ino = entry
                    .parent_id()
                    .map(|p| ctx.inodes.ino_for(p))
                    .unwrap_or(ROOT_INO);
                if emit(ino, FileType::Directory, ".") {
                    return Ok(());
                }
                if emit(parent_ino, FileType::Directory, "..") {
                    return Ok(());
                }
                for child in &children {
                    if child.state() == ItemState::Deleted {
                        continue;
                    }
                    let child_ino = ctx.inodes.ino_for(child.id());
                    let kind = if child.is_directory() {
                        FileType::Directory
                    } else {
                        FileType::RegularFile
                    };
                    if emit(child_ino, kind, child.name()) {
                        break;
                    }
                }
                Ok(())
            }
            .await;
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let ctx = self.ctx.clone();
        let token = self.op_token();
        let fh = self.alloc_fh();
        self.rt.spawn(async move {
            let result: Result<ItemId, FuseError> = async {
                let (id, entry) = ctx.entry_for_ino(ino).await?;
                if entry.is_directory() {
                    return Err(FuseError::IsDirectory);
                }
                ctx.ensure_content(&id, &token).await?;
                ctx.engine.cache.open(&id)?;
                Ok(id)
            }
            .await;
            match result {
                Ok(id) => {
                    ctx.handles.insert(
                        fh,
                        OpenHandle {
                            id,
                            is_dir: false,
                            marked_dirty: false,
                        },
                    );
                    reply.opened(fh, 0);
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.ctx.handles.get(&fh) else {
            return reply.error(libc::EBADF);
        };
        let id = handle.id.clone();
        drop(handle);
        match self.ctx.engine.cache.read_at(&id, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.ctx.handles.get(&fh) else {
            return reply.error(libc::EBADF);
        };
        let id = handle.id.clone();
        let needs_mark = !handle.marked_dirty;
        drop(handle);

        match self.ctx.engine.cache.write_at(&id, offset.max(0) as u64, data) {
            Ok(written) => {
                if needs_mark {
                    let result = self.rt.block_on(self.ctx.engine.state.mark_dirty(&id));
                    match result {
                        Ok(()) => {
                            if let Some(mut handle) = self.ctx.handles.get_mut(&fh) {
                                handle.marked_dirty = true;
                            }
                        }
                        Err(e) => return reply.error(e.errno()),
                    }
                }
                reply.written(written);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    #[allow(clippy::too_many_arguments)]
    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some((_, handle)) = self.ctx.handles.remove(&fh) else {
            return reply.error(libc::EBADF);
        };
        if !handle.is_dir {
            self.ctx.engine.cache.release(&handle.id);
        }

        // A dirty entry starts its upload on release. Conflicts detected
        // later never fail this call; the entry is marked and the user is
        // notified through the feedback channel.
        let ctx = self.ctx.clone();
        let id = handle.id;
        self.rt.spawn(async move {
            let Ok(Some(entry)) = ctx.engine.state.store().get(&id).await else {
                return;
            };
            if entry.state() != ItemState::DirtyLocal || entry.is_virtual() {
                return;
            }
            let offline = ctx
                .record_if_offline(
                    ChangeKind::Modify,
                    &id,
                    ChangePayload {
                        content_ref: Some(ctx.engine.cache.path_for(&id)),
                        parent_id: entry.parent_id().cloned(),
                        ..ChangePayload::default()
                    },
                )
                .await;
            match offline {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(e) = ctx.engine.uploads.enqueue(&id).await {
                        tracing::warn!(id = %id, error = %e, "failed to queue upload on release");
                    }
                }
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "failed to record offline modify");
                }
            }
        });
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match valid_name(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.errno()),
        };
        let ctx = self.ctx.clone();
        let (uid, gid) = (self.uid, self.gid);
        self.rt.spawn(async move {
            let result: Result<(u64, FileAttr), FuseError> = async {
                let parent_id = ctx
                    .inodes
                    .id_for(parent)
                    .ok_or(FuseError::StaleInode(parent))?;
                let store = ctx.engine.state.store();
                if let Some(existing) = store.lookup_child(&parent_id, &name).await? {
                    if existing.state() != ItemState::Deleted {
                        return Err(FuseError::Core(CoreError::Validation(format!(
                            "{name} already exists"
                        ))));
                    }
                }

                let item = Item::new_local(name.clone(), parent_id.clone(), true);
                let id = item.id.clone();
                let entry =
                    MetadataEntry::from_local_create(item, ctx.engine.state.default_overlay());

                // While offline the change is logged before the local
                // apply; online it goes straight to the mutation queue.
                let logged = ctx
                    .record_if_offline(
                        ChangeKind::Create,
                        &id,
                        ChangePayload {
                            name: Some(name.clone()),
                            parent_id: Some(parent_id.clone()),
                            is_directory: true,
                            ..ChangePayload::default()
                        },
                    )
                    .await?;

                ctx.engine.state.insert_local(&entry).await?;
                if !logged {
                    ctx.engine
                        .mutations
                        .enqueue(MutationJob::create_dir(id.clone(), parent_id, name))
                        .await?;
                }

                let ino = ctx.inodes.ino_for(&id);
                Ok((ino, ctx.attr(&entry, ino, uid, gid)))
            }
            .await;
            match result {
                Ok((_, attr)) => reply.entry(&TTL, &attr, 0),
                Err(e) => {
                    let errno = match &e {
                        FuseError::Core(CoreError::Validation(_)) => libc::EEXIST,
                        other => other.errno(),
                    };
                    reply.error(errno);
                }
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match valid_name(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.errno()),
        };
        let ctx = self.ctx.clone();
        let (uid, gid) = (self.uid, self.gid);
        let fh = self.alloc_fh();
        self.rt.spawn(async move {
            let result: Result<(u64, FileAttr), FuseError> = async {
                let parent_id = ctx
                    .inodes
                    .id_for(parent)
                    .ok_or(FuseError::StaleInode(parent))?;
                let store = ctx.engine.state.store();
                if let Some(existing) = store.lookup_child(&parent_id, &name).await? {
                    if existing.state() != ItemState::Deleted {
                        return Err(FuseError::Core(CoreError::Validation(format!(
                            "{name} already exists"
                        ))));
                    }
                }

                let item = Item::new_local(name.clone(), parent_id.clone(), false);
                let id = item.id.clone();
                let entry =
                    MetadataEntry::from_local_create(item, ctx.engine.state.default_overlay());

                ctx.record_if_offline(
                    ChangeKind::Create,
                    &id,
                    ChangePayload {
                        name: Some(name.clone()),
                        parent_id: Some(parent_id.clone()),
                        is_directory: false,
                        content_ref: Some(ctx.engine.cache.path_for(&id)),
                        ..ChangePayload::default()
                    },
                )
                .await?;

                ctx.engine.cache.insert(&id, b"")?;
                ctx.engine.state.insert_local(&entry).await?;
                ctx.engine.cache.open(&id)?;

                let ino = ctx.inodes.ino_for(&id);
                ctx.handles.insert(
                    fh,
                    OpenHandle {
                        id,
                        is_dir: false,
                        marked_dirty: true, // born dirty
                    },
                );
                Ok((ino, ctx.attr(&entry, ino, uid, gid)))
            }
            .await;
            match result {
                Ok((_, attr)) => reply.created(&TTL, &attr, 0, fh, 0),
                Err(e) => {
                    let errno = match &e {
                        FuseError::Core(CoreError::Validation(_)) => libc::EEXIST,
                        other => other.errno(),
                    };
                    reply.error(errno);
                }
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match valid_name(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.errno()),
        };
        let ctx = self.ctx.clone();
        self.rt.spawn(async move {
            match remove_entry(&ctx, parent, &name, false).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match valid_name(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.errno()),
        };
        let ctx = self.ctx.clone();
        self.rt.spawn(async move {
            match remove_entry(&ctx, parent, &name, true).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (valid_name(name), valid_name(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => return reply.error(e.errno()),
        };
        let ctx = self.ctx.clone();
        self.rt.spawn(async move {
            match rename_entry(&ctx, parent, &name, newparent, &newname).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let ctx = self.ctx.clone();
        let result = self.rt.block_on(async {
            let files = ctx.engine.state.store().count_entries().await?;
            Ok::<_, CoreError>(files)
        });
        match result {
            Ok(files) => {
                let total = self.ctx.engine.cache.total_size();
                let max = self.ctx.engine.cache.max_size();
                let block = u64::from(BLOCK_SIZE);
                // With no configured bound, report a nominal 1 TiB volume.
                let capacity = if max > 0 { max } else { 1 << 40 };
                let blocks = capacity.div_ceil(block);
                let free = capacity.saturating_sub(total).div_ceil(block);
                reply.statfs(blocks, free, free, files, u64::MAX, BLOCK_SIZE, NAME_MAX as u32, BLOCK_SIZE);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let ctx = self.ctx.clone();
        let Some(name) = name.to_str().map(str::to_string) else {
            return reply.error(libc::ENOTSUP);
        };
        match self.rt.block_on(ctx.entry_for_ino(ino)) {
            Ok((_, entry)) => {
                let value: Vec<u8> = match name.as_str() {
                    xattr::STATUS_XATTR => entry.status().as_str().as_bytes().to_vec(),
                    xattr::PIN_XATTR => xattr::pin_value(entry.pin_mode()).to_vec(),
                    _ => return reply.error(libc::ENODATA),
                };
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if size as usize >= value.len() {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, size: u32, reply: ReplyXattr) {
        let list = xattr::name_list();
        if size == 0 {
            reply.size(list.len() as u32);
        } else if size as usize >= list.len() {
            reply.data(&list);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(name) = name.to_str().map(str::to_string) else {
            return reply.error(libc::ENOTSUP);
        };
        match name.as_str() {
            xattr::PIN_XATTR => {
                let Some(mode) = xattr::parse_pin_value(value) else {
                    return reply.error(libc::EINVAL);
                };
                let ctx = self.ctx.clone();
                self.rt.spawn(async move {
                    let result: Result<(), FuseError> = async {
                        let (id, entry) = ctx.entry_for_ino(ino).await?;
                        ctx.engine.state.set_pin(&id, mode).await?;
                        // Pinning a ghost starts its hydration right away.
                        if mode == PinMode::Always && entry.state() == ItemState::Ghost {
                            let ticket = ctx
                                .engine
                                .hydration
                                .queue(&id, HydrationPriority::Background)
                                .await?;
                            ticket.forget();
                        }
                        Ok(())
                    }
                    .await;
                    match result {
                        Ok(()) => reply.ok(),
                        Err(e) => reply.error(e.errno()),
                    }
                });
            }
            xattr::STATUS_XATTR => reply.error(libc::EACCES),
            other => {
                xattr::warn_unsupported(other);
                reply.error(libc::ENOTSUP);
            }
        }
    }
}

// ============================================================================
// Shared mutation paths
// ============================================================================

/// Common unlink/rmdir path: tombstone locally, queue (or log) the remote
/// delete. Cache content is kept until the remote confirms, so a failed
/// delete can be rolled back.
async fn remove_entry(
    ctx: &FsCtx,
    parent: u64,
    name: &str,
    expect_dir: bool,
) -> Result<(), FuseError> {
    let parent_id = ctx
        .inodes
        .id_for(parent)
        .ok_or(FuseError::StaleInode(parent))?;
    let store = ctx.engine.state.store();
    let entry = store
        .lookup_child(&parent_id, name)
        .await?
        .filter(|e| e.state() != ItemState::Deleted)
        .ok_or_else(|| FuseError::Core(CoreError::NotFound(format!("{name} not found"))))?;

    if expect_dir && !entry.is_directory() {
        return Err(FuseError::NotDirectory);
    }
    if !expect_dir && entry.is_directory() {
        return Err(FuseError::IsDirectory);
    }
    if entry.is_virtual() {
        return Err(FuseError::Core(CoreError::Permission(
            "virtual entries cannot be removed".into(),
        )));
    }
    if entry.is_directory() {
        let children = store.list_children(entry.id()).await?;
        if children.iter().any(|c| c.state() != ItemState::Deleted) {
            return Err(FuseError::NotEmpty);
        }
    }

    let id = entry.id().clone();

    // In-flight transfers are cancelled before the tombstone.
    if entry.state() == ItemState::Uploading {
        ctx.engine.uploads.cancel(&id).await?;
    }
    if entry.state() == ItemState::Hydrating {
        ctx.engine.hydration.cancel(&id);
    }

    let logged = ctx
        .record_if_offline(ChangeKind::Delete, &id, ChangePayload {
            parent_id: Some(parent_id.clone()),
            ..ChangePayload::default()
        })
        .await?;

    // The offline compaction of a never-uploaded item removes the entry
    // entirely; only tombstone what is still there.
    if store.get(&id).await?.is_some() {
        ctx.engine.state.mark_deleted(&id).await?;
        ctx.engine.state.set_pending_remote(&id, true).await?;
        if !logged {
            ctx.engine
                .mutations
                .enqueue(MutationJob::delete(id.clone(), parent_id))
                .await?;
        }
    }
    Ok(())
}

/// Purely-local rename plus a queued remote PATCH. The open-file handle
/// keeps pointing at the same id, so renaming an open file is safe.
async fn rename_entry(
    ctx: &FsCtx,
    parent: u64,
    name: &str,
    newparent: u64,
    newname: &str,
) -> Result<(), FuseError> {
    let parent_id = ctx
        .inodes
        .id_for(parent)
        .ok_or(FuseError::StaleInode(parent))?;
    let newparent_id = ctx
        .inodes
        .id_for(newparent)
        .ok_or(FuseError::StaleInode(newparent))?;

    // Same-level locks in deterministic order; held only for the
    // check-then-act on the destination, never across an await into the
    // network.
    {
        let locks = ctx
            .inodes
            .ordered_locks((parent, &parent_id), (newparent, &newparent_id));
        let _guards: Vec<_> = locks.iter().map(|l| write_lock(l)).collect();
    }

    let store = ctx.engine.state.store();
    let entry = store
        .lookup_child(&parent_id, name)
        .await?
        .filter(|e| e.state() != ItemState::Deleted)
        .ok_or_else(|| FuseError::Core(CoreError::NotFound(format!("{name} not found"))))?;
    if entry.is_virtual() {
        return Err(FuseError::Core(CoreError::Permission(
            "virtual entries cannot be renamed".into(),
        )));
    }
    let id = entry.id().clone();

    // POSIX rename replaces an existing destination.
    if let Some(existing) = store.lookup_child(&newparent_id, newname).await? {
        if existing.id() != &id && existing.state() != ItemState::Deleted {
            if existing.is_directory() {
                let children = store.list_children(existing.id()).await?;
                if children.iter().any(|c| c.state() != ItemState::Deleted) {
                    return Err(FuseError::NotEmpty);
                }
            }
            remove_entry(ctx, newparent, newname, existing.is_directory()).await?;
        }
    }

    let logged = ctx
        .record_if_offline(
            ChangeKind::Rename,
            &id,
            ChangePayload {
                parent_id: Some(parent_id.clone()),
                new_name: Some(newname.to_string()),
                new_parent_id: Some(newparent_id.clone()),
                ..ChangePayload::default()
            },
        )
        .await?;

    ctx.engine
        .state
        .apply_local_rename(&id, newname, &newparent_id)
        .await?;

    if !logged {
        ctx.engine
            .mutations
            .enqueue(MutationJob::rename(
                id,
                newparent_id.clone(),
                newname.to_string(),
                newparent_id,
            ))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_name_limits() {
        assert!(valid_name(OsStr::new("normal.txt")).is_ok());
        assert!(valid_name(OsStr::new("")).is_err());
        assert!(valid_name(OsStr::new("a/b")).is_err());
        assert!(valid_name(OsStr::new(&"x".repeat(NAME_MAX))).is_ok());
        assert!(valid_name(OsStr::new(&"x".repeat(NAME_MAX + 1))).is_err());
    }

    #[test]
    fn test_system_time_clamps_pre_epoch() {
        let before_epoch = chrono::DateTime::<chrono::Utc>::from_timestamp(-100, 0).unwrap();
        assert_eq!(system_time(before_epoch), UNIX_EPOCH);

        let after = chrono::DateTime::<chrono::Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(
            system_time(after),
            UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
    }
}
