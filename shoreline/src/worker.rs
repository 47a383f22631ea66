use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::acceptor::{run_acceptor, AcceptorConfig};
use crate::config::Config;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::runtime::handler::AsyncEventHandler;

/// Result type for [`ShorelineBuilder::launch`].
type LaunchResult = Result<(ShutdownHandle, Vec<thread::JoinHandle<Result<(), Error>>>), Error>;

fn os_err() -> Error {
    Error::Io(io::Error::last_os_error())
}

/// Handle returned by `launch()` to trigger graceful shutdown.
pub struct ShutdownHandle {
    shutdown_flag: Arc<AtomicBool>,
    worker_eventfds: Vec<RawFd>,
    listen_fd: Option<RawFd>,
    listen_fd_closed: Option<Arc<AtomicBool>>,
}

impl ShutdownHandle {
    /// Per-worker eventfds; external threads can write to these to wake
    /// specific workers.
    pub fn worker_eventfds(&self) -> &[RawFd] {
        &self.worker_eventfds
    }

    /// Signal all workers to shut down gracefully.
    ///
    /// Workers stop accepting, close their connections, drain remaining
    /// CQEs, and exit their loops returning `Ok(())`. The listen fd is
    /// closed to unblock the acceptor's `accept4`.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
        if let (Some(fd), Some(closed)) = (self.listen_fd, &self.listen_fd_closed) {
            if !closed.swap(true, Ordering::AcqRel) {
                unsafe {
                    libc::close(fd);
                }
            }
        }
        // Wake workers blocked in submit_and_wait.
        for &efd in &self.worker_eventfds {
            let val: u64 = 1;
            unsafe {
                libc::write(efd, &val as *const u64 as *const libc::c_void, 8);
            }
        }
    }
}

/// Acceptor-to-worker link: the accept channel plus the eventfd that
/// kicks the worker's ring after a send.
struct WorkerLink {
    tx: crossbeam_channel::Sender<(RawFd, SocketAddr)>,
    rx: crossbeam_channel::Receiver<(RawFd, SocketAddr)>,
    eventfd: RawFd,
}

fn create_worker_links(count: usize) -> Result<Vec<WorkerLink>, Error> {
    let mut links: Vec<WorkerLink> = Vec::with_capacity(count);
    for _ in 0..count {
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if efd < 0 {
            let err = os_err();
            for link in &links {
                unsafe {
                    libc::close(link.eventfd);
                }
            }
            return Err(err);
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        links.push(WorkerLink {
            tx,
            rx,
            eventfd: efd,
        });
    }
    Ok(links)
}

/// Builder for launching worker threads with an optional listener.
///
/// Create with [`ShorelineBuilder::new(config)`](Self::new), optionally
/// [`.bind(addr)`](Self::bind) for inbound connections, then
/// [`.launch::<Handler>()`](Self::launch).
///
/// Without a bind address the engine runs client-only: no listener or
/// acceptor thread, and workers open outbound connections from
/// [`AsyncEventHandler::on_start`].
pub struct ShorelineBuilder {
    config: Config,
    bind_addr: Option<SocketAddr>,
}

impl ShorelineBuilder {
    pub fn new(config: Config) -> Self {
        ShorelineBuilder {
            config,
            bind_addr: None,
        }
    }

    /// Bind address for the TCP listener. Unset means client-only mode.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Launch worker threads running the handler.
    ///
    /// Each worker owns its own ring, executor, and connection table;
    /// every accepted connection gets a long-lived task on the worker
    /// that accepted it.
    pub fn launch<A: AsyncEventHandler>(self) -> LaunchResult {
        let num_threads = if self.config.worker.threads == 0 {
            num_cpus()
        } else {
            self.config.worker.threads
        };

        ensure_nofile_limit(self.config.max_connections, num_threads)?;

        let links = create_worker_links(num_threads)?;
        let worker_eventfds: Vec<RawFd> = links.iter().map(|l| l.eventfd).collect();
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let (listen_fd, listen_fd_closed) = match self.bind_addr {
            Some(addr) => {
                let fd = create_listener(addr, self.config.backlog)?;
                let closed = spawn_acceptor(fd, &links, self.config.tcp_nodelay)?;
                (Some(fd), Some(closed))
            }
            None => (None, None),
        };
        let has_acceptor = listen_fd.is_some();

        let mut handles = Vec::with_capacity(num_threads);
        for (worker_id, link) in links.into_iter().enumerate() {
            let config = self.config.clone();
            let shutdown_flag = shutdown_flag.clone();

            let handle = thread::Builder::new()
                .name(format!("shoreline-worker-{worker_id}"))
                .spawn(move || {
                    if config.worker.pin_to_core {
                        pin_to_core(config.worker.core_offset + worker_id)?;
                    }

                    // In client-only mode the rx would never see a send;
                    // the worker skips the accept path entirely.
                    let accept_rx = if has_acceptor { Some(link.rx) } else { None };
                    let handler = A::create_for_worker(worker_id);
                    let mut event_loop =
                        EventLoop::new(&config, handler, accept_rx, link.eventfd, shutdown_flag)?;
                    event_loop.run()
                })
                .map_err(Error::Io)?;

            handles.push(handle);
        }

        let shutdown_handle = ShutdownHandle {
            shutdown_flag,
            worker_eventfds,
            listen_fd,
            listen_fd_closed,
        };

        Ok((shutdown_handle, handles))
    }
}

/// Start the acceptor thread for an already-listening fd. The returned
/// flag records whether the listen fd has been closed, whichever side
/// (acceptor exit or shutdown) gets there first.
fn spawn_acceptor(
    listen_fd: RawFd,
    links: &[WorkerLink],
    tcp_nodelay: bool,
) -> Result<Arc<AtomicBool>, Error> {
    let acceptor_config = AcceptorConfig {
        listen_fd,
        worker_channels: links.iter().map(|l| l.tx.clone()).collect(),
        worker_eventfds: links.iter().map(|l| l.eventfd).collect(),
        tcp_nodelay,
    };

    let closed = Arc::new(AtomicBool::new(false));
    let acceptor_closed = closed.clone();
    thread::Builder::new()
        .name("shoreline-acceptor".to_string())
        .spawn(move || {
            run_acceptor(acceptor_config);
            if !acceptor_closed.swap(true, Ordering::AcqRel) {
                unsafe {
                    libc::close(listen_fd);
                }
            }
        })
        .map_err(Error::Io)?;

    Ok(closed)
}

/// Ensure RLIMIT_NOFILE covers the fixed file table registration.
///
/// Each worker calls `register_files_sparse(max_connections)` and the
/// kernel checks `nr_args > rlimit(RLIMIT_NOFILE)` per call, not
/// cumulatively. Connections live in the fixed table (the original fd is
/// closed right after `register_files_update`), so only ring fds,
/// eventfds, the listen socket, and stdio need process fd entries.
fn ensure_nofile_limit(max_connections: u32, num_workers: usize) -> Result<(), Error> {
    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return Err(os_err());
    }

    let per_worker_overhead: u64 = 8;
    let global_overhead: u64 = 64;
    let required =
        max_connections as u64 + per_worker_overhead * num_workers as u64 + global_overhead;

    if rlim.rlim_cur >= required {
        return Ok(());
    }

    let hard = rlim.rlim_max;
    if hard < required && hard != libc::RLIM_INFINITY {
        return Err(Error::ResourceLimit(format!(
            "RLIMIT_NOFILE too low: need {} but hard limit is {} (soft: {}). \
             Raise it with: ulimit -n {}",
            required, hard, rlim.rlim_cur, required
        )));
    }

    rlim.rlim_cur = if hard == libc::RLIM_INFINITY {
        required
    } else {
        std::cmp::min(required, hard)
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } != 0 {
        return Err(os_err());
    }
    Ok(())
}

/// Pin the current thread to a CPU core.
fn pin_to_core(core: usize) -> Result<(), Error> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(os_err());
        }
    }
    Ok(())
}

/// Create the TCP listener (SO_REUSEADDR only; a single acceptor thread
/// owns it).
fn create_listener(addr: SocketAddr, backlog: i32) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(os_err());
    }

    let close_with = |err: Error| {
        unsafe {
            libc::close(fd);
        }
        Err(err)
    };

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = crate::driver::socket_addr_to_sockaddr(addr, &mut storage);

    if unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) } < 0 {
        return close_with(os_err());
    }

    // The fd stays blocking; the acceptor thread parks in accept4.
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return close_with(os_err());
    }

    Ok(fd)
}

fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 {
        1
    } else {
        ret as usize
    }
}
