//! QUIC 感知的 UDP 转发引擎
//!
//! 数据流：
//!
//! 1. listener 任务从监听 socket 收 datagram，遍历 coalesced packets，
//!    取首个 packet 的 DCID 作为整个 datagram 的路由键
//! 2. 会话命中 → 迁移检测 + 记账，整个 datagram 原样写入该会话的后端 socket
//! 3. 未命中且是 Initial → 解密提取 SNI → 解析路由 → 建立会话
//!    (专属后端 socket + backend reader 任务) → 转发原始 datagram
//! 4. 未命中且不是 Initial → 丢弃
//!
//! 回程：每个会话一个 backend reader，侦听服务端签发的 SCID 注册进
//! 会话表，然后把回包通过监听 socket 发往会话*当前*的客户端地址。
//!
//! datagram 永远不会被拆分、合并或改写；转发的字节与收到的完全一致。
//! 所有 datagram 级错误都是局部的：丢弃该 datagram，会话表不受影响。

pub mod session;

use crate::quic::{
    extract_sni_from_initial, parse_datagram, parse_packet, QuicError, SHORT_HEADER_DCID_LEN,
};
use crate::resolver::RouteResolver;
use anyhow::Result;
use session::{Session, SessionTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// 监听缓冲大小。未验证路径上的 QUIC datagram 不超过 1200 字节，
/// 2 KiB 对任何合法首个 flight 都足够。
const MAX_DATAGRAM_SIZE: usize = 2048;

/// 转发引擎调优参数
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// 会话空闲超时
    pub idle_timeout: Duration,
    /// 会话清理间隔
    pub cleanup_interval: Duration,
    /// 是否记录每个被丢弃 datagram 的原因
    pub log_requests: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
            log_requests: false,
        }
    }
}

/// QUIC SNI 中继
pub struct Relay {
    socket: Arc<UdpSocket>,
    resolver: Arc<dyn RouteResolver>,
    sessions: Arc<SessionTable>,
    config: RelayConfig,
    shutdown: broadcast::Sender<()>,
}

impl Relay {
    /// 绑定监听 socket 并创建中继
    pub async fn bind(
        listen_addr: SocketAddr,
        resolver: Arc<dyn RouteResolver>,
        config: RelayConfig,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(listen_addr).await?;
        info!("UDP relay listening on {}", socket.local_addr()?);

        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            socket: Arc::new(socket),
            resolver,
            sessions: Arc::new(SessionTable::new()),
            config,
            shutdown,
        })
    }

    /// 监听 socket 的实际地址 (监听 `:0` 时拿真实端口)
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// 取消信号句柄：send 一次即触发整体停机
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 运行中继主循环
    ///
    /// datagram 在 listener 任务内联处理，保证同一会话内的包按接收
    /// 顺序写入后端。只有监听 socket 自身的错误会向上传播。
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.spawn_cleanup_task();

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (n, src) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            error!("Listener socket failed: {}", e);
                            return Err(e.into());
                        }
                    };

                    // datagram 拷贝一次，监听缓冲立即可复用
                    let data = buf[..n].to_vec();
                    self.handle_datagram(src, &data).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Relay shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// 处理一个入站 datagram；所有错误就地消化
    async fn handle_datagram(&self, src: SocketAddr, data: &[u8]) {
        let packets = match parse_datagram(data) {
            Ok(packets) => packets,
            Err(e) => {
                if self.config.log_requests {
                    let kind = match e {
                        QuicError::VersionNegotiation => "version_negotiation",
                        QuicError::UnsupportedVersion { .. } => "unsupported_version",
                        _ => "parse_error",
                    };
                    debug!(client = %src, error = %e, "{}", kind);
                }
                return;
            }
        };

        let first = match packets.first() {
            Some(first) => first,
            None => return, // 空 datagram
        };
        let dcid = first.dcid.clone();

        // 会话命中：迁移检测 + 记账，整包转发
        if let Some(session) = self.sessions.get(&dcid) {
            if let Some(old_addr) = session.touch(src) {
                info!(
                    client = %src,
                    old_client = %old_addr,
                    backend = %session.backend_addr,
                    dcid = %hex::encode(&dcid),
                    sni = %session.sni,
                    "migrated"
                );
            }

            match session.backend_socket.send(data).await {
                Ok(_) => session.mark_active(),
                Err(e) => {
                    // 发送失败只丢这个 datagram，会话保留
                    warn!(
                        client = %src,
                        backend = %session.backend_addr,
                        error = %e,
                        "socket_error"
                    );
                }
            }
            return;
        }

        // 未命中：只有 Initial packet 才能催生新会话
        if !first.is_initial() {
            if self.config.log_requests {
                debug!(
                    client = %src,
                    dcid = %hex::encode(&dcid),
                    "dropped_unknown"
                );
            }
            return;
        }

        let sni = match extract_sni_from_initial(data, first) {
            Ok(sni) => sni,
            Err(e) => {
                if self.config.log_requests {
                    let kind = match &e {
                        QuicError::SniNotFound => "sni_not_found",
                        QuicError::SniIncomplete | QuicError::OutOfOrderCrypto { .. } => {
                            "sni_incomplete"
                        }
                        QuicError::DecryptionFailed(_)
                        | QuicError::HeaderProtectionFailed(_)
                        | QuicError::KeyDerivationFailed(_) => "decrypt_failed",
                        _ => "parse_error",
                    };
                    debug!(
                        client = %src,
                        dcid = %hex::encode(&dcid),
                        error = %e,
                        "{}", kind
                    );
                }
                return;
            }
        };

        let backend_addr = match self.resolver.resolve(&sni).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(
                    client = %src,
                    dcid = %hex::encode(&dcid),
                    sni = %sni,
                    error = %e,
                    "no_route"
                );
                return;
            }
        };

        let backend_socket = match connect_backend(backend_addr).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!(backend = %backend_addr, error = %e, "socket_error");
                return;
            }
        };

        let session = Session::new(sni.clone(), backend_addr, backend_socket, src);

        if !self.sessions.insert_if_absent(dcid.clone(), &session) {
            // 同一 DCID 的会话刚被注册 (如客户端重发 Initial)，
            // 新建的 socket 随 session 一起丢弃，走已有会话转发。
            if let Some(existing) = self.sessions.get(&dcid) {
                let _ = existing.backend_socket.send(data).await;
            }
            return;
        }

        self.spawn_backend_reader(session.clone());

        info!(
            client = %src,
            backend = %backend_addr,
            dcid = %hex::encode(&dcid),
            sni = %sni,
            "new_session"
        );

        // 原始 (加密的、未改动的) datagram 整包转发
        match session.backend_socket.send(data).await {
            Ok(_) => session.mark_active(),
            Err(e) => {
                warn!(
                    client = %src,
                    backend = %backend_addr,
                    error = %e,
                    "socket_error"
                );
            }
        }
    }

    /// backend reader：每会话一个，随会话消亡
    ///
    /// 职责：(a) 侦听服务端长头 packet 的 SCID 注册进会话表；
    /// (b) 把回包改投会话当前的客户端地址。
    fn spawn_backend_reader(&self, session: Arc<Session>) {
        let listen_socket = self.socket.clone();
        let sessions = self.sessions.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    result = session.backend_socket.recv(&mut buf) => {
                        let n = match result {
                            Ok(n) => n,
                            Err(e) => {
                                // 接收侧错误终止会话；客户端下一个 Initial 会重建
                                debug!(
                                    backend = %session.backend_addr,
                                    error = %e,
                                    "backend reader exiting"
                                );
                                break;
                            }
                        };

                        snoop_server_cids(&sessions, &session, &buf[..n]);

                        let client_addr = session.client_addr();
                        if let Err(e) = listen_socket.send_to(&buf[..n], client_addr).await {
                            // 回程发送失败只丢这个 datagram
                            debug!(client = %client_addr, error = %e, "socket_error");
                        }
                    }
                    _ = session.wait_closed() => break,
                    _ = shutdown.recv() => break,
                }
            }

            // reader 退出与会话移除、socket 释放绑定在一起
            sessions.remove_session(&session);
        });
    }

    /// 周期清理空闲会话
    fn spawn_cleanup_task(&self) {
        let sessions = self.sessions.clone();
        let idle_timeout = self.config.idle_timeout;
        let cleanup_interval = self.config.cleanup_interval;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = sessions.expire_idle(idle_timeout);
                        if removed > 0 {
                            debug!("Expired {} idle sessions", removed);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}

/// 为会话开一个专属后端 socket：绑定临时端口并 connect 到后端。
/// connect 让内核替我们分流回程包，应用层无需再按源地址复用。
async fn connect_backend(backend_addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind_addr: SocketAddr = if backend_addr.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(backend_addr).await?;
    Ok(socket)
}

/// 从后端回包中侦听服务端签发的 Connection ID
///
/// 服务端长头 packet 的 SCID 是客户端后续会使用的 DCID。把每个 SCID
/// 和它的 8 字节前缀 (供 Short Header 启发式匹配) 注册给本会话。
/// 解析失败就停止侦听，datagram 照常转发，不做任何校验。
fn snoop_server_cids(sessions: &SessionTable, session: &Arc<Session>, datagram: &[u8]) {
    let mut curr = 0;

    while curr < datagram.len() {
        let packet = match parse_packet(&datagram[curr..]) {
            Ok(packet) => packet,
            Err(_) => break,
        };

        if packet.is_long_header && !packet.scid.is_empty() {
            if packet.scid.len() > SHORT_HEADER_DCID_LEN {
                let prefix = packet.scid.slice(..SHORT_HEADER_DCID_LEN);
                sessions.insert_if_absent(prefix, session);
            }
            sessions.insert_if_absent(packet.scid.clone(), session);
        }

        curr += packet.full_length;
        if !packet.is_long_header {
            break;
        }
    }
}
