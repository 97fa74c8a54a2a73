//! Re-exec's itself as both parent and child to exercise the full stack
//! across a real OS process boundary: a `BrokerHost`/`BrokerClient`
//! handshake that agrees on a pipe id, then a `MessagePipeDispatcher`-backed
//! pipe carrying a real file descriptor across the wire via `FdTransport`.

#[cfg(unix)]
mod unix_main {
    use portmux::broker::{BrokerClient, BrokerEvent, BrokerHost, ProcessId, BROKER_ROUTE};
    use portmux::registry::{MessagePipeDispatcher, Registry};
    use portmux::routed::ChannelPump;
    use portmux::transport::unix::FdTransport;
    use portmux::transport::ByteTransport;
    use portmux::{Delegate, Error, FrameLimits, PlatformHandle, ReadFlags, RoutedChannel, ThreadTaskRunner, WaitFlags};
    use std::io::{self, Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::os::unix::net::UnixStream;
    use std::process::Command;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    const CHILD_FD_ENV: &str = "PORTMUX_TEST_CHILD_FD";

    /// Forwards every frame arriving on [`BROKER_ROUTE`] to the test's main
    /// thread, decoded via [`BrokerClient::decode`].
    struct BrokerRouteDelegate(mpsc::Sender<BrokerEvent>);

    impl Delegate for BrokerRouteDelegate {
        fn on_read_message(&self, bytes: Vec<u8>, handles: Vec<PlatformHandle>) {
            match BrokerClient::decode(&bytes, handles) {
                Ok(event) => {
                    let _ = self.0.send(event);
                }
                Err(err) => eprintln!("malformed broker message: {err}"),
            }
        }

        fn on_error(&self, _error: Error) {}
    }

    /// Runs posted tasks synchronously on the caller's thread. Only used for
    /// the broker's own throwaway self-channel below, which never pumps.
    struct ImmediateRunner;
    impl portmux::TaskRunner for ImmediateRunner {
        fn post(&self, task: portmux::io_worker::Task) {
            task();
        }
    }

    fn recv_event(rx: &mpsc::Receiver<BrokerEvent>) -> BrokerEvent {
        rx.recv_timeout(Duration::from_secs(5)).expect("timed out waiting for a broker event")
    }

    fn clear_cloexec(fd: RawFd) {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }
    }

    /// Wraps `stream` in an `FdTransport`-backed `RoutedChannel` pumped by
    /// its own `ThreadTaskRunner`. Returns the channel plus the pump handle,
    /// which the caller must keep alive for as long as inbound frames need
    /// to be dispatched.
    fn spawn_fd_channel(stream: UnixStream) -> (Arc<RoutedChannel>, Arc<dyn portmux::io_worker::Pumpable>) {
        let transport = Arc::new(FdTransport::new(stream, FrameLimits::default()).unwrap());
        let io_worker = ThreadTaskRunner::spawn("portmux-test-io");
        let channel = RoutedChannel::new(transport, io_worker.clone(), FrameLimits::default(), Box::new(|| {}));
        let pump: Arc<dyn portmux::io_worker::Pumpable> = Arc::new(ChannelPump::new(&channel));
        io_worker.register_pumpable(Arc::downgrade(&pump));
        (channel, pump)
    }

    /// A channel the broker host writes its own side of an introduction to.
    /// Nobody ever reads from it: a host that is also one of the two
    /// introduced processes already has its `Introduction` return value and
    /// has no real use for a wire round trip to itself.
    fn throwaway_self_channel() -> Arc<RoutedChannel> {
        let transport = Arc::new(ByteTransport::new(io::empty(), io::sink(), FrameLimits::default()));
        RoutedChannel::new(transport, Arc::new(ImmediateRunner), FrameLimits::default(), Box::new(|| {}))
    }

    fn wait_readable(dispatcher: &Arc<MessagePipeDispatcher>) {
        let (tx, rx) = mpsc::channel();
        match dispatcher.add_waiter(WaitFlags::READABLE, 0, Box::new(move |result| {
            let _ = tx.send(result);
        })) {
            Ok(()) => {
                rx.recv_timeout(Duration::from_secs(5))
                    .expect("timed out waiting for readability")
                    .unwrap();
            }
            Err(Error::AlreadyExists) => {}
            Err(e) => panic!("add_waiter failed: {e}"),
        }
    }

    /// Ships a real pipe read end carrying a known payload, plus an
    /// application message, through `dispatcher`.
    fn send_carrier(dispatcher: &Arc<MessagePipeDispatcher>, label: &str) {
        let (read_end, mut write_end) = {
            let mut fds = [0 as RawFd; 2];
            let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
            assert_eq!(rc, 0, "pipe(2) failed");
            let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
            let write_end = unsafe { std::fs::File::from_raw_fd(fds[1]) };
            (read_end, write_end)
        };
        write_end.write_all(format!("{label}-payload").as_bytes()).unwrap();
        drop(write_end);

        dispatcher
            .write_message(b"carrier".to_vec(), vec![PlatformHandle::from_fd(read_end)])
            .unwrap();
    }

    /// Receives the carrier sent by [`send_carrier`] and confirms the
    /// attached file descriptor round-tripped its kernel-backed contents.
    fn recv_carrier(dispatcher: &Arc<MessagePipeDispatcher>, expected_label: &str) {
        wait_readable(dispatcher);
        let (bytes, mut handles) = dispatcher.read_message(64, ReadFlags::None).unwrap();
        assert_eq!(bytes, b"carrier");
        assert_eq!(handles.len(), 1);

        let received_fd = handles.remove(0).into_raw();
        let mut received_file = unsafe { std::fs::File::from_raw_fd(received_fd) };
        let mut contents = String::new();
        received_file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, format!("{expected_label}-payload"));
        println!("received handle round-tripped real kernel pipe contents: {contents}");
    }

    fn child_main(stream: UnixStream) {
        let child_id = ProcessId::generate();
        let (channel, pump) = spawn_fd_channel(stream);

        let (tx, rx) = mpsc::channel();
        let broker_delegate: Arc<dyn Delegate> = Arc::new(BrokerRouteDelegate(tx));
        channel.add_route(BROKER_ROUTE, &broker_delegate).unwrap();

        let broker_client = BrokerClient::new(child_id, channel.clone(), BROKER_ROUTE);
        broker_client.send_hello().unwrap();
        println!("[child] sent HELLO as {child_id}");

        let (pipe_id, parent_id) = loop {
            match recv_event(&rx) {
                BrokerEvent::PipeReady { pipe_id, peer_process_id } => break (pipe_id, peer_process_id),
                other => panic!("unexpected broker event on child before PIPE_READY: {}", describe(&other)),
            }
        };
        println!("[child] broker assigned pipe {pipe_id}, peer is {parent_id}");

        let registry = Registry::new();
        let dispatcher = registry.connect_message_pipe(parent_id, pipe_id, || channel.clone()).unwrap();

        send_carrier(&dispatcher, "child");
        recv_carrier(&dispatcher, "parent");

        dispatcher.close().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        drop(pump);
    }

    fn parent_main() {
        let (parent_sock, child_sock) = UnixStream::pair().unwrap();
        clear_cloexec(child_sock.as_raw_fd());

        let mut child = Command::new(std::env::current_exe().unwrap())
            .env(CHILD_FD_ENV, child_sock.as_raw_fd().to_string())
            .spawn()
            .unwrap();
        drop(child_sock);

        let parent_id = ProcessId::generate();
        let (channel, pump) = spawn_fd_channel(parent_sock);

        let (tx, rx) = mpsc::channel();
        let broker_delegate: Arc<dyn Delegate> = Arc::new(BrokerRouteDelegate(tx));
        channel.add_route(BROKER_ROUTE, &broker_delegate).unwrap();

        let child_id = loop {
            match recv_event(&rx) {
                BrokerEvent::PeerHello(child_id) => break child_id,
                other => panic!("unexpected broker event on parent before HELLO: {}", describe(&other)),
            }
        };
        println!("[parent] received HELLO from {child_id}");

        let broker = BrokerHost::new();
        broker.register_client(child_id, channel.clone());
        broker.register_client(parent_id, throwaway_self_channel());

        let introduction = broker.connect_message_pipe(parent_id, child_id).unwrap();
        println!(
            "[parent] introduced {} <-> {} on pipe {}",
            introduction.requester, introduction.target, introduction.pipe_id
        );

        let registry = Registry::new();
        let dispatcher = registry.connect_message_pipe(child_id, introduction.pipe_id, || channel.clone()).unwrap();

        recv_carrier(&dispatcher, "child");
        send_carrier(&dispatcher, "parent");

        let status = child.wait().unwrap();
        assert!(status.success());

        dispatcher.close().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        drop(pump);
        println!("portmux integration test passed");
    }

    fn describe(event: &BrokerEvent) -> &'static str {
        match event {
            BrokerEvent::PeerHello(_) => "PeerHello",
            BrokerEvent::ConnectToProcess { .. } => "ConnectToProcess",
            BrokerEvent::PipeReady { .. } => "PipeReady",
        }
    }

    pub fn main() {
        env_logger::init();
        if let Ok(fd_str) = std::env::var(CHILD_FD_ENV) {
            let fd: RawFd = fd_str.parse().expect("malformed child fd env var");
            let stream = unsafe { UnixStream::from_raw_fd(fd) };
            child_main(stream);
        } else {
            parent_main();
        }
    }
}

#[cfg(unix)]
fn main() {
    unix_main::main();
}

#[cfg(not(unix))]
fn main() {
    // FdTransport's real handle transfer is Unix-only (SCM_RIGHTS); the
    // multiplexing/broker logic itself is platform-independent and is
    // covered by the unit tests in `portmux`'s own crate, which run on
    // every platform.
    println!("portmux-integration-test: skipped, this test exercises the Unix-only FdTransport");
}
