//! Watcher core: construction, the poll loop, and the mark API
//!
//! One background thread owns the notification fd. It polls the fd
//! together with a self-pipe: the pipe is the only cancellation channel,
//! because an application-level flag cannot interrupt a descriptor the
//! thread is blocked on. Decoded events go out over three rendezvous
//! channels (notifications, permission requests, errors); a slow consumer
//! blocks the loop, which is the intended backpressure. Every publish
//! races a done latch so that `close` can wake a blocked publisher.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use libc::{c_uint, c_void};
use log::{debug, error, warn};

use crate::decoder::{DecodeError, EventMetadata, FidInfo, RecordIter, EVENT_METADATA_LEN};
use crate::error::{Result, WatcherError};
use crate::event::{Event, Op, PermissionEvent};
use crate::flags::{self, EventMask, InitFlags, PermissionMode, EVENT_F_FLAGS};
use crate::kernel::{self, KernelVersion};
use crate::linux;
use crate::mount::Mount;

/// Minimum read buffer: room for 4096 metadata-sized records.
const READ_BUFFER_LEN: usize = 4096 * EVENT_METADATA_LEN;

/// A fanotify watcher.
///
/// Watches paths under a single mount point, delivering notification
/// events, permission requests and runtime errors on three channels. The
/// mount is bound lazily by the first successful [`add`](Watcher::add).
pub struct Watcher {
    fd: Option<OwnedFd>,
    init_flags: InitFlags,
    mode: PermissionMode,
    kernel: KernelVersion,
    mount: Arc<OnceLock<Mount>>,
    stopper_w: Option<OwnedFd>,
    closed: Arc<AtomicBool>,
    done_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    events: Receiver<Event>,
    permissions: Receiver<PermissionEvent>,
    errors: Receiver<WatcherError>,
    errors_tx: Option<Sender<WatcherError>>,
}

impl Watcher {
    /// Create a watcher with flags negotiated for the running kernel.
    pub fn new(mode: PermissionMode) -> Result<Self> {
        Self::with_flags(InitFlags::empty(), mode)
    }

    /// Create a watcher with extra init flags or-ed into the negotiated
    /// set. The combined flags are validated against fanotify's rules and
    /// the detected kernel before any syscall.
    pub fn with_flags(extra: InitFlags, mode: PermissionMode) -> Result<Self> {
        if !kernel::have_sys_admin()? {
            return Err(WatcherError::MissingCapability);
        }
        let kernel = KernelVersion::detect()?;
        let init_flags = flags::negotiated_init_flags(kernel, mode) | extra;
        flags::flags_valid(init_flags, mode)?;
        flags::init_flags_supported(init_flags, kernel)?;

        let raw = unsafe { libc::fanotify_init(init_flags.bits() | mode.class_bits(), EVENT_F_FLAGS) };
        if raw < 0 {
            return Err(WatcherError::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let (stopper_r, stopper_w) = new_stopper_pipe()?;

        let (events_tx, events) = bounded(0);
        let (permissions_tx, permissions) = bounded(0);
        let (errors_tx, errors) = bounded(0);
        let (done_tx, done_rx) = bounded::<()>(0);

        let mount: Arc<OnceLock<Mount>> = Arc::new(OnceLock::new());

        let event_loop = EventLoop {
            fd: fd.as_raw_fd(),
            stopper: stopper_r,
            mount: Arc::clone(&mount),
            events: events_tx,
            permissions: permissions_tx,
            errors: errors_tx.clone(),
            done: done_rx,
            self_pid: unsafe { libc::getpid() },
        };
        let thread = std::thread::Builder::new()
            .name("fanotify-watcher".into())
            .spawn(move || event_loop.run())
            .map_err(WatcherError::Io)?;

        debug!("watcher started on kernel {kernel} with init flags {init_flags:?}");
        Ok(Watcher {
            fd: Some(fd),
            init_flags,
            mode,
            kernel,
            mount,
            stopper_w: Some(stopper_w),
            closed: Arc::new(AtomicBool::new(false)),
            done_tx: Some(done_tx),
            thread: Some(thread),
            events,
            permissions,
            errors,
            errors_tx: Some(errors_tx),
        })
    }

    /// The stream of notification events.
    pub fn events(&self) -> Receiver<Event> {
        self.events.clone()
    }

    /// The stream of permission requests.
    pub fn permission_events(&self) -> Receiver<PermissionEvent> {
        self.permissions.clone()
    }

    /// The stream of runtime errors.
    pub fn errors(&self) -> Receiver<WatcherError> {
        self.errors.clone()
    }

    /// The init flags negotiated at construction.
    pub fn init_flags(&self) -> InitFlags {
        self.init_flags
    }

    /// The kernel version detected at construction.
    pub fn kernel_version(&self) -> KernelVersion {
        self.kernel
    }

    /// The permission mode the watcher was created with.
    pub fn mode(&self) -> PermissionMode {
        self.mode
    }

    /// True once [`close`](Watcher::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Watch `path` for the full operation set.
    ///
    /// The first successful call binds the watcher to the mount the path
    /// lives on; later calls must stay on the same device. Events are
    /// raised for the marked object and, for directories, its immediate
    /// children.
    pub fn add<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.ensure_open()?;
        let mount = self.bind_mount(path)?;
        if !mount.contains(path)? {
            return Err(WatcherError::PathOutsideMount {
                path: path.to_path_buf(),
            });
        }
        self.mark(
            libc::FAN_MARK_ADD,
            mask_for_mode(self.mode) | EventMask::EVENT_ON_CHILD,
            Some(path),
        )
    }

    /// Remove the mark added for `path`.
    pub fn remove<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.ensure_open()?;
        self.mark(
            libc::FAN_MARK_REMOVE,
            mask_for_mode(self.mode) | EventMask::EVENT_ON_CHILD,
            Some(path.as_ref()),
        )
    }

    /// Watch the entire bound mount.
    ///
    /// Requires the mount binding established by a prior [`add`]; the
    /// mask is restricted to what the kernel accepts on mount-scope
    /// marks.
    ///
    /// [`add`]: Watcher::add
    pub fn watch_mount(&self) -> Result<()> {
        self.ensure_open()?;
        let mount = self.mount.get().ok_or(WatcherError::MountNotFound {
            path: PathBuf::new(),
        })?;
        let mount_point = mount.mount_point().to_path_buf();
        self.mark(
            libc::FAN_MARK_ADD | libc::FAN_MARK_MOUNT,
            EventMask::MOUNT_SCOPE,
            Some(&mount_point),
        )
    }

    /// Flush every mark owned by this notification group.
    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.mark(libc::FAN_MARK_FLUSH, EventMask::empty(), None)
    }

    /// Stop the watcher and release its resources.
    ///
    /// Writes one byte to the self-pipe, joins the poll thread, then
    /// closes the notification fd, the mount root and the pipe. All
    /// three streams are disconnected when this returns. Safe to call
    /// more than once; later calls are no-ops.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake any publisher blocked on a rendezvous send.
        drop(self.done_tx.take());
        if let Some(w) = &self.stopper_w {
            let rc = unsafe { libc::write(w.as_raw_fd(), b"s".as_ptr() as *const c_void, 1) };
            if rc < 0 {
                warn!("stopper write failed: {}", io::Error::last_os_error());
            }
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        // The thread has exited; nothing reads the notification fd now.
        if let Some(fd) = self.fd.take() {
            let raw = fd.into_raw_fd();
            if unsafe { libc::close(raw) } != 0 {
                let err = WatcherError::last_os_error();
                if let Some(tx) = &self.errors_tx {
                    let _ = tx.try_send(err);
                }
            }
        }
        if let Some(lock) = Arc::get_mut(&mut self.mount) {
            lock.take();
        }
        self.stopper_w.take();
        self.errors_tx.take();
        debug!("watcher closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WatcherError::Closed);
        }
        Ok(())
    }

    fn notify_fd(&self) -> Result<RawFd> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or(WatcherError::Closed)
    }

    /// Bind the mount on first use; afterwards only hand out the binding.
    fn bind_mount(&self, path: &Path) -> Result<&Mount> {
        if let Some(mount) = self.mount.get() {
            return Ok(mount);
        }
        let resolved = Mount::resolve(path)?;
        debug!(
            "bound mount {:?} (device {})",
            resolved.mount_point(),
            resolved.device
        );
        // A lost race just means another caller bound the same mount.
        let _ = self.mount.set(resolved);
        Ok(self.mount.get().expect("mount bound"))
    }

    fn mark(&self, mark_flags: c_uint, mask: EventMask, path: Option<&Path>) -> Result<()> {
        flags::mark_mask_supported(mask, self.kernel)?;
        if mark_flags & libc::FAN_MARK_MOUNT != 0 {
            flags::mount_mask_valid(mask)?;
        }
        let cpath = match path {
            Some(p) => Some(CString::new(p.as_os_str().as_bytes()).map_err(|_| {
                WatcherError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "path contains an interior NUL byte",
                ))
            })?),
            None => None,
        };
        let rc = unsafe {
            libc::fanotify_mark(
                self.notify_fd()?,
                mark_flags,
                mask.bits(),
                libc::AT_FDCWD,
                cpath
                    .as_ref()
                    .map(|c| c.as_ptr())
                    .unwrap_or(std::ptr::null()),
            )
        };
        if rc < 0 {
            return Err(WatcherError::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// The operation mask a watch subscribes to, by permission mode.
fn mask_for_mode(mode: PermissionMode) -> EventMask {
    if mode.is_permission() {
        EventMask::WITH_PERMISSIONS
    } else {
        EventMask::NOTIFICATION
    }
}

/// Create the self-pipe; the read end is non-blocking so a drained pipe
/// can never stall the poll loop.
fn new_stopper_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(WatcherError::last_os_error());
    }
    let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    let fl = unsafe { libc::fcntl(r.as_raw_fd(), libc::F_GETFL, 0) };
    if fl < 0 {
        return Err(WatcherError::last_os_error());
    }
    if unsafe { libc::fcntl(r.as_raw_fd(), libc::F_SETFL, fl | libc::O_NONBLOCK) } < 0 {
        return Err(WatcherError::last_os_error());
    }
    Ok((r, w))
}

/// What to do after attempting to hand one record on.
enum Flow {
    Continue,
    /// A stream is gone; the loop must stop.
    Stop,
    /// The buffer can no longer be trusted; drop the rest of it.
    DropBuffer,
}

/// State owned by the poll-loop thread.
struct EventLoop {
    fd: RawFd,
    stopper: OwnedFd,
    mount: Arc<OnceLock<Mount>>,
    events: Sender<Event>,
    permissions: Sender<PermissionEvent>,
    errors: Sender<WatcherError>,
    done: Receiver<()>,
    self_pid: i32,
}

impl EventLoop {
    fn run(self) {
        let mut buf = vec![0u8; READ_BUFFER_LEN];
        let mut fds = [
            libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.stopper.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            fds[0].revents = 0;
            fds[1].revents = 0;
            let n = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                if !self.send_error(WatcherError::Io(err)) {
                    break;
                }
                continue;
            }
            if n == 0 {
                continue;
            }
            if fds[1].revents & libc::POLLIN != 0 {
                debug!("stop signal on self-pipe");
                break;
            }
            if fds[0].revents & libc::POLLIN != 0 && !self.drain(&mut buf) {
                break;
            }
        }
        debug!("fanotify event loop stopped");
    }

    /// One read, one batch. Returns false when the loop must stop.
    fn drain(&self, buf: &mut [u8]) -> bool {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return true;
            }
            return self.send_error(WatcherError::Io(err));
        }
        let mut iter = RecordIter::new(&buf[..n as usize]);
        for (meta, record) in iter.by_ref() {
            if meta.vers != libc::FANOTIFY_METADATA_VERSION {
                error!(
                    "kernel fanotify metadata version {} does not match compiled version {}",
                    meta.vers,
                    libc::FANOTIFY_METADATA_VERSION
                );
                std::process::abort();
            }
            let flow = if meta.has_fd() {
                self.deliver_classic(&meta)
            } else {
                self.deliver_fid(&meta, record)
            };
            match flow {
                Flow::Continue => {}
                Flow::Stop => return false,
                Flow::DropBuffer => break,
            }
        }
        if iter.remaining() != 0 {
            warn!(
                "dropping {} trailing bytes of undecodable event data",
                iter.remaining()
            );
        }
        true
    }

    /// Kernel-supplied fd: the path comes from /proc/self/fd.
    fn deliver_classic(&self, meta: &EventMetadata) -> Flow {
        let fd = unsafe { OwnedFd::from_raw_fd(meta.fd) };
        let path = match std::fs::read_link(format!("/proc/self/fd/{}", meta.fd)) {
            Ok(path) => path,
            Err(err) => {
                return if self.send_error(WatcherError::Io(err)) {
                    Flow::Continue
                } else {
                    Flow::Stop
                };
            }
        };
        let op = Op::from_raw_mask(meta.mask);
        if op.is_permission() {
            if meta.pid == self.self_pid {
                // Answering our own access requests through the channel
                // would deadlock the watcher against itself.
                self.allow_direct(fd);
                return Flow::Continue;
            }
            let event = PermissionEvent::new(path, op, meta.pid, fd, self.fd);
            if self.send_permission(event) {
                Flow::Continue
            } else {
                Flow::Stop
            }
        } else {
            let event = Event {
                path,
                op,
                fd,
                pid: meta.pid,
            };
            if self.send_event(event) {
                Flow::Continue
            } else {
                Flow::Stop
            }
        }
    }

    /// FID mode: resolve the file handle against the mount root.
    fn deliver_fid(&self, meta: &EventMetadata, record: &[u8]) -> Flow {
        if meta.event_len as usize == meta.metadata_len as usize {
            if meta.mask & linux::FAN_Q_OVERFLOW != 0 {
                warn!("kernel event queue overflowed; events were lost");
            } else {
                warn!("skipping event without fd or info record (mask {:#x})", meta.mask);
            }
            return Flow::Continue;
        }
        let fid = match FidInfo::parse(record, meta.metadata_len) {
            Ok(fid) => fid,
            Err(err) => return self.reject_buffer(err),
        };
        match fid.info_type {
            linux::FAN_EVENT_INFO_TYPE_FID
            | linux::FAN_EVENT_INFO_TYPE_DFID
            | linux::FAN_EVENT_INFO_TYPE_DFID_NAME => {}
            other => {
                debug!("skipping info record of unhandled type {other}");
                return Flow::Continue;
            }
        }
        let Some(mount) = self.mount.get() else {
            warn!("event arrived with no mount bound; dropping");
            return Flow::Continue;
        };
        let raw = unsafe {
            linux::open_by_handle_at(mount.root.as_raw_fd(), fid.handle.as_ptr(), libc::O_RDONLY)
        };
        if raw < 0 {
            let err = io::Error::last_os_error();
            return if self.send_error(WatcherError::Io(err)) {
                Flow::Continue
            } else {
                Flow::Stop
            };
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let mut path = match std::fs::read_link(format!("/proc/self/fd/{raw}")) {
            Ok(path) => path,
            Err(err) => {
                return if self.send_error(WatcherError::Io(err)) {
                    Flow::Continue
                } else {
                    Flow::Stop
                };
            }
        };
        if let Some(name) = &fid.name {
            path.push(name);
        }
        // Permission events never arrive in FID mode (kernels through
        // 6.0), so this is always a notification.
        let event = Event {
            path,
            op: Op::from_raw_mask(meta.mask),
            fd,
            pid: meta.pid,
        };
        if self.send_event(event) {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    fn reject_buffer(&self, err: DecodeError) -> Flow {
        warn!("undecodable event record ({err}); dropping the rest of the buffer");
        let io_err = io::Error::new(io::ErrorKind::InvalidData, err.to_string());
        if self.send_error(WatcherError::Io(io_err)) {
            Flow::DropBuffer
        } else {
            Flow::Stop
        }
    }

    fn allow_direct(&self, fd: OwnedFd) {
        let record = libc::fanotify_response {
            fd: fd.as_raw_fd(),
            response: libc::FAN_ALLOW,
        };
        let rc = unsafe {
            libc::write(
                self.fd,
                &record as *const _ as *const c_void,
                std::mem::size_of::<libc::fanotify_response>(),
            )
        };
        if rc < 0 {
            warn!(
                "allowing own permission event failed: {}",
                io::Error::last_os_error()
            );
        }
    }

    fn send_event(&self, event: Event) -> bool {
        select! {
            send(self.events, event) -> res => res.is_ok(),
            recv(self.done) -> _ => false,
        }
    }

    fn send_permission(&self, event: PermissionEvent) -> bool {
        select! {
            send(self.permissions, event) -> res => res.is_ok(),
            recv(self.done) -> _ => false,
        }
    }

    fn send_error(&self, err: WatcherError) -> bool {
        select! {
            send(self.errors, err) -> res => res.is_ok(),
            recv(self.done) -> _ => false,
        }
    }
}
