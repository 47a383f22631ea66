use std::net::SocketAddr;
use std::os::fd::RawFd;

use crossbeam_channel::Sender;

/// Configuration for the centralized acceptor thread. Shutdown is
/// signalled by closing the listen fd, which fails the blocking accept.
pub struct AcceptorConfig {
    /// The listening socket fd.
    pub listen_fd: RawFd,
    /// Per-worker channels carrying accepted (fd, peer_addr) pairs.
    pub worker_channels: Vec<Sender<(RawFd, SocketAddr)>>,
    /// Per-worker eventfds to wake each worker's ring.
    pub worker_eventfds: Vec<RawFd>,
    /// Set TCP_NODELAY on accepted sockets.
    pub tcp_nodelay: bool,
}

/// A worker the acceptor can still hand connections to. Entries whose
/// channel has disconnected are dropped from the rotation.
struct WorkerSlot {
    channel: Sender<(RawFd, SocketAddr)>,
    eventfd: RawFd,
}

struct Acceptor {
    listen_fd: RawFd,
    workers: Vec<WorkerSlot>,
    next_worker: usize,
    tcp_nodelay: bool,
}

/// Run the acceptor loop. Terminates when all worker channels disconnect
/// or the listen fd is closed.
///
/// Accepts via blocking `accept4` and hands raw fds to workers
/// round-robin, waking each worker through its eventfd. Each connection
/// lives on exactly one worker from here on.
pub fn run_acceptor(config: AcceptorConfig) {
    let workers = config
        .worker_channels
        .into_iter()
        .zip(config.worker_eventfds)
        .map(|(channel, eventfd)| WorkerSlot { channel, eventfd })
        .collect::<Vec<_>>();
    if workers.is_empty() {
        return;
    }

    Acceptor {
        listen_fd: config.listen_fd,
        workers,
        next_worker: 0,
        tcp_nodelay: config.tcp_nodelay,
    }
    .run();
}

impl Acceptor {
    fn run(mut self) {
        loop {
            let (fd, peer_addr) = match self.accept_one() {
                Some(accepted) => accepted,
                None => return,
            };

            if self.tcp_nodelay {
                set_nodelay(fd);
            }

            if !self.dispatch(fd, peer_addr) {
                unsafe {
                    libc::close(fd);
                }
                return;
            }
        }
    }

    /// Block in `accept4` until a connection arrives. None means the
    /// listen fd is gone (shutdown) or accept failed fatally.
    fn accept_one(&mut self) -> Option<(RawFd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        loop {
            let mut addr_len =
                std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    self.listen_fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut addr_len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd >= 0 {
                let peer = decode_sockaddr(&storage)
                    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
                return Some((fd, peer));
            }

            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => {}
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    // Out of fds; back off briefly.
                    log::warn!("accept failed, fd limit reached: {err}");
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                _ => return None,
            }
        }
    }

    /// Offer the fd to live workers round-robin, pruning any whose
    /// channel has closed. False once no workers remain.
    fn dispatch(&mut self, fd: RawFd, peer_addr: SocketAddr) -> bool {
        while !self.workers.is_empty() {
            let idx = self.next_worker % self.workers.len();
            self.next_worker = self.next_worker.wrapping_add(1);

            if self.workers[idx].channel.send((fd, peer_addr)).is_err() {
                self.workers.swap_remove(idx);
                continue;
            }

            // Kick the worker's ring out of its cqe wait.
            let val: u64 = 1;
            unsafe {
                libc::write(
                    self.workers[idx].eventfd,
                    &val as *const u64 as *const libc::c_void,
                    8,
                );
            }
            return true;
        }
        false
    }
}

fn set_nodelay(fd: RawFd) {
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Convert the `sockaddr_storage` filled by accept4 to a `SocketAddr`.
fn decode_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(sa.sin_port))))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sa.sin6_port))))
        }
        _ => None,
    }
}
