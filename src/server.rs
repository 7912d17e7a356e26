//! The server mode machine: VIP presence decides between master and slave
//! mode; the master runs the listeners and the interval tick, a slave
//! follows the master's replication stream until promoted.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use snafu::{ResultExt, Snafu};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{error, info, warn};

use hoardd_wire::memcache::{MemcacheDecoder, Request};
use hoardd_wire::FrameError;

use crate::counter::CounterGc;
use crate::gc::{vip_is_local, CacheGc};
use crate::replication::{apply_replicated, run_slave_reader, run_slave_writer};
use crate::shared::Shared;
use crate::{counter, memcache, MASTER_CHECKS};

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(display("cannot listen on {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[snafu(display("cannot install signal handlers: {source}"))]
    Signals { source: std::io::Error },

    #[snafu(display("replication failed: {source}"))]
    Replication {
        source: crate::replication::ReplicaError,
    },
}

/// Signals of interest, multiplexed into one stream of events.
pub struct Signals {
    term: Signal,
    int: Signal,
    quit: Signal,
    hup: Signal,
    usr1: Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig {
    /// SIGTERM / SIGINT / SIGQUIT: leave the serve loop.
    Shutdown,
    /// SIGHUP: reopen the log file.
    ReopenLog,
    /// SIGUSR1: dump one-line statistics.
    DumpStats,
}

impl Signals {
    pub fn install() -> Result<Self, ServerError> {
        Ok(Self {
            term: signal(SignalKind::terminate()).context(SignalsSnafu)?,
            int: signal(SignalKind::interrupt()).context(SignalsSnafu)?,
            quit: signal(SignalKind::quit()).context(SignalsSnafu)?,
            hup: signal(SignalKind::hangup()).context(SignalsSnafu)?,
            usr1: signal(SignalKind::user_defined1()).context(SignalsSnafu)?,
        })
    }

    pub async fn recv(&mut self) -> Sig {
        tokio::select! {
            _ = self.term.recv() => Sig::Shutdown,
            _ = self.int.recv() => Sig::Shutdown,
            _ = self.quit.recv() => Sig::Shutdown,
            _ = self.hup.recv() => Sig::ReopenLog,
            _ = self.usr1.recv() => Sig::DumpStats,
        }
    }
}

enum SlaveEnd {
    Signaled,
    Promoted,
    Disconnected,
}

pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Runs until shut down by a signal. Master mode is terminal: once
    /// promoted, the process stays master until it exits.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut signals = Signals::install()?;

        loop {
            if vip_is_local(self.shared.config.virtual_ip) {
                return self.serve_master(&mut signals).await;
            }

            match self.serve_slave(&mut signals).await? {
                SlaveEnd::Signaled => return Ok(()),
                SlaveEnd::Promoted => continue,
                SlaveEnd::Disconnected => {
                    // wait a little for the VIP to land here before
                    // chasing the master again.
                    for _ in 0..MASTER_CHECKS {
                        if vip_is_local(self.shared.config.virtual_ip) {
                            break;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                            sig = signals.recv() => {
                                if self.handle_side_signal(sig) {
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Handles non-shutdown signals; returns `true` on shutdown.
    fn handle_side_signal(&self, sig: Sig) -> bool {
        match sig {
            Sig::Shutdown => true,
            Sig::ReopenLog => {
                self.shared.log.reopen();
                info!("got SIGHUP");
                false
            }
            Sig::DumpStats => {
                self.shared.dump_stats();
                false
            }
        }
    }

    fn listen_addrs(&self, port: u16) -> Vec<SocketAddr> {
        let config = &self.shared.config;
        if config.bind_ip.is_empty() {
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)]
        } else {
            let mut addrs = vec![SocketAddr::new(config.virtual_ip, port)];
            addrs.extend(config.bind_ip.iter().map(|ip| SocketAddr::new(*ip, port)));
            addrs
        }
    }

    async fn bind_all(&self, port: u16) -> Result<Vec<TcpListener>, ServerError> {
        let mut listeners = Vec::new();
        for addr in self.listen_addrs(port) {
            listeners.push(TcpListener::bind(addr).await.context(BindSnafu { addr })?);
        }
        Ok(listeners)
    }

    async fn serve_master(&self, signals: &mut Signals) -> Result<(), ServerError> {
        info!("entering master mode");
        self.shared.set_slave_mode(false);

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for listener in self.bind_all(self.shared.config.port).await? {
            tasks.push(tokio::spawn(serve_memcache_listener(
                self.shared.clone(),
                listener,
            )));
        }
        for listener in self.bind_all(self.shared.config.repl_port).await? {
            tasks.push(tokio::spawn(serve_repl_listener(
                self.shared.clone(),
                listener,
            )));
        }
        if self.shared.config.counter.enable {
            let addr = SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                self.shared.config.counter.port,
            );
            let listener = TcpListener::bind(addr).await.context(BindSnafu { addr })?;
            tasks.push(tokio::spawn(serve_counter_listener(
                self.shared.clone(),
                listener,
            )));
        }

        let now = self.shared.now();
        let mut gc = CacheGc::new(now);
        let mut counter_gc = CounterGc::new(now);
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = self.shared.tick_clock();
                    self.shared.repl.prune(now, self.shared.config.slave_timeout);
                    gc.maybe_start(&self.shared, now);
                    if self.shared.config.counter.enable {
                        counter_gc.maybe_start(&self.shared, now);
                    }
                }
                sig = signals.recv() => {
                    if self.handle_side_signal(sig) {
                        break;
                    }
                }
            }
        }

        info!("exiting");
        gc.shutdown();
        counter_gc.shutdown();
        self.shared.repl.clear();
        for task in tasks {
            task.abort();
        }
        Ok(())
    }

    async fn serve_slave(&self, signals: &mut Signals) -> Result<SlaveEnd, ServerError> {
        self.shared.set_slave_mode(true);
        // a rejoin starts from a clean slate; the master sends a full
        // snapshot first.
        self.shared.clear_for_slave();

        let master = SocketAddr::new(self.shared.config.virtual_ip, self.shared.config.repl_port);
        let stream = match TcpStream::connect(master).await {
            Ok(stream) => stream,
            Err(_) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                return Ok(SlaveEnd::Disconnected);
            }
        };
        let _ = stream.set_nodelay(true);

        info!("slave start");
        let (read, mut write) = stream.into_split();
        let mut framed = FramedRead::with_capacity(
            read,
            MemcacheDecoder::new(self.shared.clock.clone()),
            1 << 20,
        );
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    None => {
                        warn!("the connection to the master has hung up");
                        break SlaveEnd::Disconnected;
                    }
                    Some(Err(FrameError::Io { .. })) => {
                        warn!("an error occurred on the connection to the master");
                        break SlaveEnd::Disconnected;
                    }
                    Some(Err(FrameError::RequestTooLarge { .. })) => {
                        error!("invalid replication data");
                        return Err(ServerError::Replication {
                            source: crate::replication::ReplicaError::CorruptStream,
                        });
                    }
                    Some(Ok(Request::Binary(req))) => {
                        apply_replicated(&self.shared, &req).context(ReplicationSnafu)?;
                    }
                    Some(Ok(Request::Text(_))) => {
                        error!("invalid replication data");
                        return Err(ServerError::Replication {
                            source: crate::replication::ReplicaError::CorruptStream,
                        });
                    }
                },
                _ = tick.tick() => {
                    self.shared.tick_clock();
                    if vip_is_local(self.shared.config.virtual_ip) {
                        break SlaveEnd::Promoted;
                    }
                    // any byte works as a heartbeat.
                    if write.write_all(&[0]).await.is_err() {
                        break SlaveEnd::Disconnected;
                    }
                }
                sig = signals.recv() => {
                    if self.handle_side_signal(sig) {
                        break SlaveEnd::Signaled;
                    }
                }
            }
        };

        info!("slave end");
        Ok(end)
    }
}

/// Accepts memcache clients; each one gets its own task.
pub async fn serve_memcache_listener(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(memcache::serve_client(shared.clone(), stream));
            }
            Err(error) => {
                warn!(%error, "memcache accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Accepts counter clients; each one gets its own task.
pub async fn serve_counter_listener(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(counter::serve_client(shared.clone(), stream));
            }
            Err(error) => {
                warn!(%error, "counter accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Accepts replica connections and wires up their reader/writer tasks.
pub async fn serve_repl_listener(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let max_buffered = shared.config.repl_buffer_size << 20;
                let Some(slave) = shared.repl.register(peer, max_buffered, shared.now()) else {
                    // at capacity; refuse by dropping the socket.
                    continue;
                };
                let _ = stream.set_nodelay(true);
                let (read, write) = stream.into_split();
                tokio::spawn(run_slave_reader(slave.clone(), shared.clone(), read));
                tokio::spawn(run_slave_writer(slave, write));
            }
            Err(error) => {
                warn!(%error, "replication accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
