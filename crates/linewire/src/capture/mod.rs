//! The Linux packet-capture device: binds an `NFQUEUE` via a raw netlink socket, drains it
//! on a dedicated reader thread, and issues an immediate `NF_DROP` verdict for every packet (this
//! tunnel chain never returns packets to the kernel's own forwarding path — it owns delivery).
//!
//! Grounded directly on a netlink/`NFQUEUE` capture loop: the constants (`kReadPacketSize`,
//! `kQueueLen`), the `iptables` bring-up/bring-down commands, and the self-pipe shutdown pattern
//! all come from that source; there is no Rust crate in this dependency stack that already speaks
//! `NFQUEUE`, so the wire format lives in [`netlink`].

#![cfg(target_os = "linux")]

pub mod netlink;

use crate::config::CaptureSettings;
use crate::error::CaptureError;
use crate::line::LineHandle;
use crate::tunnel::TunnelChain;
use std::mem;
use std::os::fd::{IntoRawFd, RawFd};
use std::process::Command;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const ETH_DATA_LEN: usize = 1500;
// `struct ethhdr` (two MAC addresses plus an ethertype).
const ETH_HDR_LEN: usize = 14;
// `struct nfqnl_msg_packet_hdr` (packet id, hw protocol, hook), word-aligned.
const NFQNL_MSG_PACKET_HDR_LEN: usize = 8;

static NEXT_QUEUE_NUM: AtomicU16 = AtomicU16::new(0);

/// Hands out queue numbers from a process-wide counter, so callers opening several capture
/// devices never collide on the same `NFQUEUE` number.
fn allocate_queue_num() -> u16 {
    NEXT_QUEUE_NUM.fetch_add(1, Ordering::Relaxed)
}

fn iptables_enable_queue(source_ip: &str, queue_num: u16) -> String {
    format!("iptables -I INPUT -s {source_ip} -j NFQUEUE --queue-num {queue_num}")
}

fn iptables_disable_queue(source_ip: &str, queue_num: u16) -> String {
    format!("iptables -D INPUT -s {source_ip} -j NFQUEUE --queue-num {queue_num}")
}

fn run_shell(command: &str) -> Result<(), CaptureError> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .map_err(CaptureError::Setup)?;

    if status.success() {
        Ok(())
    } else {
        Err(CaptureError::CommandFailed(status.code().unwrap_or(-1)))
    }
}

fn open_netlink_socket() -> Result<RawFd, CaptureError> {
    // SAFETY: a bare `socket(2)` syscall, no pointers involved.
    let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, netlink::NETLINK_NETFILTER) };
    if fd < 0 {
        return Err(CaptureError::Setup(std::io::Error::last_os_error()));
    }

    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as u16;
    addr.nl_pid = 0; // let the kernel assign a unique port id
    addr.nl_groups = 0;

    // SAFETY: `addr` is a valid, fully initialized `sockaddr_nl` of the right size for `bind`.
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as u32,
        )
    };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(CaptureError::Setup(err));
    }

    Ok(fd)
}

fn raw_write(fd: RawFd, buf: &[u8]) -> std::io::Result<usize> {
    // SAFETY: `buf` is a valid, readable slice of its own length; `fd` is caller-owned for the
    // duration of this call.
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    // SAFETY: `buf` is a valid, writable slice of its own length; `fd` is caller-owned.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn send_all(fd: RawFd, msg: &[u8]) -> Result<(), CaptureError> {
    let sent = raw_write(fd, msg).map_err(CaptureError::Setup)?;
    if sent != msg.len() {
        return Err(CaptureError::Config("short write to netlink socket"));
    }
    Ok(())
}

/// Bring-up/bring-down of an `iptables` rule plus the netlink socket that drains the queue it
/// feeds. `Drop` runs [`CaptureDevice::stop`] if it hasn't been called already.
pub struct CaptureDevice {
    queue_num: u16,
    source_ip: String,
    socket_fd: RawFd,
    shutdown_write: RawFd,
    shutdown_read: RawFd,
    packets_queued: Arc<AtomicUsize>,
    reader: Option<JoinHandle<()>>,
}

impl CaptureDevice {
    /// Allocates a queue number, adds the `iptables` rule, opens and configures the netlink
    /// socket, and starts the reader thread delivering captured packets onto `line` via
    /// `chain.up_stream_payload(0, ...)`.
    pub fn start(
        source_ip: impl Into<String>,
        settings: CaptureSettings,
        chain: Arc<TunnelChain>,
        line: LineHandle,
    ) -> Result<Self, CaptureError> {
        let source_ip = source_ip.into();
        let queue_num = allocate_queue_num();
        // A failing bring-up command is fatal, unlike the socket syscalls below: there is no
        // sane partial state to report back through `Result` from here, since nothing has been
        // allocated yet for the caller to clean up.
        run_shell(&iptables_enable_queue(&source_ip, queue_num))
            .expect("failed to install the NFQUEUE iptables rule on capture device bring-up");

        let socket_fd = match open_netlink_socket() {
            Ok(fd) => fd,
            Err(err) => {
                run_shell(&iptables_disable_queue(&source_ip, queue_num))
                    .expect("failed to remove the NFQUEUE iptables rule while rolling back a failed bring-up");
                return Err(err);
            }
        };

        // Unbind first in case a previous registration of this queue number is still lingering
        // (e.g. a process that crashed without tearing down), then bind fresh.
        send_all(socket_fd, &netlink::config_cmd_message(queue_num, 1, false))?;
        send_all(socket_fd, &netlink::config_cmd_message(queue_num, 2, true))?;
        let copy_range = (ETH_DATA_LEN + ETH_HDR_LEN + NFQNL_MSG_PACKET_HDR_LEN) as u32;
        send_all(
            socket_fd,
            &netlink::config_params_message(queue_num, 3, copy_range),
        )?;
        send_all(
            socket_fd,
            &netlink::config_queue_maxlen_message(queue_num, 4, settings.queue_max_length),
        )?;

        let (shutdown_read, shutdown_write) = nix::unistd::pipe()
            .map_err(|e| CaptureError::Setup(std::io::Error::from_raw_os_error(e as i32)))?;
        let shutdown_read = shutdown_read.into_raw_fd();
        let shutdown_write = shutdown_write.into_raw_fd();

        let packets_queued = Arc::new(AtomicUsize::new(0));
        let reader = {
            let packets_queued = packets_queued.clone();
            std::thread::Builder::new()
                .name("linewire-capture".into())
                .spawn(move || {
                    read_loop(socket_fd, shutdown_read, queue_num, settings, packets_queued, chain, line);
                })
                .expect("failed to spawn capture reader thread")
        };

        Ok(Self {
            queue_num,
            source_ip,
            socket_fd,
            shutdown_write,
            shutdown_read,
            packets_queued,
            reader: Some(reader),
        })
    }

    /// Number of packets currently between "read off the netlink socket" and "finished traversing
    /// the tunnel chain" — the signal the reader thread paces itself against.
    pub fn packets_queued(&self) -> usize {
        self.packets_queued.load(Ordering::SeqCst)
    }

    /// Writing raw packets back out through a capture device is not supported; the chain always
    /// owns delivery for packets it has already captured. Mirrors the source's disabled write
    /// routine.
    pub fn write(&self, _packet: &[u8]) -> Result<(), CaptureError> {
        Err(CaptureError::Config("capture device write path is not supported"))
    }

    /// Tears the capture device down. Bring-up can hand a failure back to its caller, but there's
    /// nobody left to hand a bring-down failure to: an `iptables -D` that fails leaves a stale
    /// `NFQUEUE` rule routing traffic into a queue nothing is reading, so this treats it as fatal
    /// rather than letting it pass silently.
    pub fn stop(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = raw_write(self.shutdown_write, &[1u8]);
            let _ = reader.join();
        }

        run_shell(&iptables_disable_queue(&self.source_ip, self.queue_num))
            .expect("failed to remove the NFQUEUE iptables rule on capture device teardown");
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        self.stop();
        unsafe {
            libc::close(self.socket_fd);
            libc::close(self.shutdown_write);
            libc::close(self.shutdown_read);
        }
    }
}

fn read_loop(
    socket_fd: RawFd,
    shutdown_fd: RawFd,
    queue_num: u16,
    settings: CaptureSettings,
    packets_queued: Arc<AtomicUsize>,
    chain: Arc<TunnelChain>,
    line: LineHandle,
) {
    let buffer_pool = line.buffer_pool().clone();
    let mut seq = 100u32;
    let mut next_wid: u16 = 0;

    loop {
        if packets_queued.load(Ordering::SeqCst) > settings.backpressure_high_watermark {
            std::thread::sleep(settings.backpressure_sleep);
            continue;
        }

        let mut fds = [
            libc::pollfd { fd: socket_fd, events: libc::POLLIN, revents: 0 },
            libc::pollfd { fd: shutdown_fd, events: libc::POLLIN, revents: 0 },
        ];

        // SAFETY: `fds` is a valid array of the length passed, for the duration of the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            continue;
        }

        if fds[1].revents & libc::POLLIN != 0 {
            return;
        }

        if fds[0].revents & libc::POLLIN == 0 {
            continue;
        }

        let mut raw = vec![0u8; settings.read_packet_size + 256];
        let n = match raw_read(socket_fd, &mut raw) {
            Ok(n) => n,
            Err(_) => continue,
        };
        raw.truncate(n);

        let Some(notification) = netlink::parse_packet_message(&raw) else {
            continue;
        };

        seq = seq.wrapping_add(1);
        let verdict = netlink::verdict_message(queue_num, seq, notification.packet_id, netlink::NF_DROP);
        let _ = send_all(socket_fd, &verdict);

        if notification.payload.is_empty() {
            continue;
        }

        let buf = buffer_pool.pull_initialised(&notification.payload);

        // Dispatch round-robin across workers: pin the line to the target worker, account the
        // packet as queued before posting, and let the posted job decrement the count before it
        // invokes the chain so the counter reflects "between read and dispatch running", not
        // "between read and dispatch finishing".
        let target_wid = next_wid;
        next_wid = (next_wid + 1) % chain.workers().wid_count();
        line.pipe_to(target_wid);

        packets_queued.fetch_add(1, Ordering::Release);
        let queued = packets_queued.clone();
        let dispatch_line = line.clone();
        chain.post(target_wid, move |chain| {
            queued.fetch_sub(1, Ordering::Release);
            chain.up_stream_payload(0, &dispatch_line, buf);
        });
    }
}
