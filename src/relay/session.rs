//! QUIC 中继会话与并发会话表
//!
//! 会话以 Connection ID 为键。一个会话在表中占有三类键，指向同一个
//! `Arc<Session>`：
//!
//! 1. 握手时客户端使用的 DCID
//! 2. 回程上侦听到的每个服务端 SCID
//! 3. 每个服务端 SCID 的 8 字节前缀 (用于匹配 Short Header 数据包)
//!
//! 回程侦听路径上并发的 datagram 可能重复注册同一个 SCID，因此写入
//! 一律走 insert-if-absent：已有映射永远不会被覆盖。

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::debug;

/// 会话生命周期
///
/// `Fresh → Active (首次成功转发) → Expired (空闲超时)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Active,
    Expired,
}

/// 会话的可变字段，统一由会话自己的锁保护。
///
/// 锁只在迁移检测和记账的短临界区内持有，绝不跨越 await。
struct SessionGuard {
    client_addr: SocketAddr,
    last_seen: Instant,
    state: SessionState,
}

/// 一个 QUIC 连接对应的中继会话
pub struct Session {
    /// 握手时提取到的 SNI
    pub sni: String,
    /// 后端地址，会话存续期间不变
    pub backend_addr: SocketAddr,
    /// 已 connect 到后端的专属 socket。
    /// listener 任务从它写，backend reader 任务从它读。
    pub backend_socket: Arc<UdpSocket>,
    guard: Mutex<SessionGuard>,
    /// 本会话在表中占有的全部 CID，过期时一并移除
    owned_cids: Mutex<Vec<Bytes>>,
    /// 关闭信号：唤醒 backend reader 退出
    closed: Notify,
}

impl Session {
    pub fn new(
        sni: String,
        backend_addr: SocketAddr,
        backend_socket: Arc<UdpSocket>,
        client_addr: SocketAddr,
    ) -> Arc<Self> {
        Arc::new(Self {
            sni,
            backend_addr,
            backend_socket,
            guard: Mutex::new(SessionGuard {
                client_addr,
                last_seen: Instant::now(),
                state: SessionState::Fresh,
            }),
            owned_cids: Mutex::new(Vec::new()),
            closed: Notify::new(),
        })
    }

    /// 当前客户端地址 (回程包的目的地)
    pub fn client_addr(&self) -> SocketAddr {
        self.guard.lock().expect("session lock poisoned").client_addr
    }

    pub fn state(&self) -> SessionState {
        self.guard.lock().expect("session lock poisoned").state
    }

    /// 记录一次 client→backend 包：刷新 last_seen，检测地址迁移。
    ///
    /// 返回迁移前的旧地址 (如果发生了迁移)。
    pub fn touch(&self, src: SocketAddr) -> Option<SocketAddr> {
        let mut guard = self.guard.lock().expect("session lock poisoned");
        guard.last_seen = Instant::now();

        if guard.client_addr != src {
            let old = std::mem::replace(&mut guard.client_addr, src);
            Some(old)
        } else {
            None
        }
    }

    /// 首次成功转发后进入 Active
    pub fn mark_active(&self) {
        let mut guard = self.guard.lock().expect("session lock poisoned");
        if guard.state == SessionState::Fresh {
            guard.state = SessionState::Active;
        }
    }

    /// 标记过期；已过期时返回 false，保证过期动作只执行一次
    fn mark_expired(&self) -> bool {
        let mut guard = self.guard.lock().expect("session lock poisoned");
        if guard.state == SessionState::Expired {
            false
        } else {
            guard.state = SessionState::Expired;
            true
        }
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.guard
            .lock()
            .expect("session lock poisoned")
            .last_seen
            .elapsed()
            >= timeout
    }

    /// 通知 backend reader 退出
    ///
    /// notify_one 会存下 permit：即使 reader 此刻没有在等待，
    /// 下一次 `wait_closed` 也会立即返回。
    pub fn notify_close(&self) {
        self.closed.notify_one();
    }

    /// reader 任务在此等待关闭信号
    pub async fn wait_closed(&self) {
        self.closed.notified().await;
    }

    fn own_cid(&self, cid: Bytes) {
        self.owned_cids
            .lock()
            .expect("session lock poisoned")
            .push(cid);
    }

    fn take_cids(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.owned_cids.lock().expect("session lock poisoned"))
    }
}

/// 并发会话表：CID 原始字节 → 会话
///
/// 分片哈希表，支持并发读与并发不相交写；insert-if-absent 是唯一的
/// 写入原语，避免回程侦听路径上的 lost update。
#[derive(Default)]
pub struct SessionTable {
    map: DashMap<Bytes, Arc<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cid: &[u8]) -> Option<Arc<Session>> {
        self.map.get(cid).map(|entry| entry.value().clone())
    }

    /// 把 CID 注册给会话 (insert-if-absent)
    ///
    /// - CID 空缺：插入并记入会话的 owned_cids，返回 true
    /// - CID 已属于同一会话：no-op，返回 true (幂等)
    /// - CID 已属于其他会话：忽略，返回 false
    pub fn insert_if_absent(&self, cid: Bytes, session: &Arc<Session>) -> bool {
        match self.map.entry(cid.clone()) {
            Entry::Occupied(entry) => Arc::ptr_eq(entry.get(), session),
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
                session.own_cid(cid);
                true
            }
        }
    }

    /// 移除会话占有的全部 CID，并把会话标记为 Expired
    ///
    /// 空闲超时和 backend reader 报错两条终止路径都经过这里，状态机
    /// 因此保持一致。只移除仍然指向该会话的条目；被其他会话占走的键
    /// 不受影响。返回本次调用是否执行了过期动作 (重复调用返回 false)。
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let expired = session.mark_expired();
        for cid in session.take_cids() {
            self.map
                .remove_if(&cid, |_, current| Arc::ptr_eq(current, session));
        }
        expired
    }

    /// 清理空闲超时的会话
    ///
    /// 过期动作：移除会话的全部 CID，通知 reader 退出；backend socket
    /// 随最后一个 Arc 引用释放，与 reader 一起消亡。
    pub fn expire_idle(&self, timeout: Duration) -> usize {
        // 先收集再移除，避免在迭代分片时写同一分片
        let mut expired: Vec<Arc<Session>> = Vec::new();
        for entry in self.map.iter() {
            let session = entry.value();
            if session.is_idle(timeout) && !expired.iter().any(|s| Arc::ptr_eq(s, session)) {
                expired.push(session.clone());
            }
        }

        let mut removed = 0;
        for session in &expired {
            if self.remove_session(session) {
                session.notify_close();
                removed += 1;
                debug!(
                    sni = %session.sni,
                    backend = %session.backend_addr,
                    "session expired"
                );
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_session(client: &str) -> Arc<Session> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect("127.0.0.1:9").await.unwrap();
        Session::new(
            "game.example.com".to_string(),
            "127.0.0.1:9".parse().unwrap(),
            Arc::new(socket),
            client.parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_insert_if_absent_idempotent() {
        let table = SessionTable::new();
        let session = test_session("1.2.3.4:50000").await;
        let cid = Bytes::from_static(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11]);

        assert!(table.insert_if_absent(cid.clone(), &session));
        // 同一会话重复注册是 no-op
        assert!(table.insert_if_absent(cid.clone(), &session));
        assert_eq!(table.len(), 1);
        // owned_cids 只记录一次
        assert_eq!(session.owned_cids.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_if_absent_rejects_other_session() {
        let table = SessionTable::new();
        let first = test_session("1.2.3.4:50000").await;
        let second = test_session("5.6.7.8:60000").await;
        let cid = Bytes::from_static(&[0x01; 8]);

        assert!(table.insert_if_absent(cid.clone(), &first));
        assert!(!table.insert_if_absent(cid.clone(), &second));

        // 原映射不被覆盖
        let got = table.get(&cid).unwrap();
        assert!(Arc::ptr_eq(&got, &first));
    }

    #[tokio::test]
    async fn test_remove_session_keeps_foreign_cids() {
        let table = SessionTable::new();
        let first = test_session("1.2.3.4:50000").await;
        let second = test_session("5.6.7.8:60000").await;

        table.insert_if_absent(Bytes::from_static(&[0x01; 8]), &first);
        table.insert_if_absent(Bytes::from_static(&[0x02; 8]), &first);
        table.insert_if_absent(Bytes::from_static(&[0x03; 8]), &second);

        assert!(table.remove_session(&first));

        assert_eq!(table.len(), 1);
        assert!(table.get(&[0x01; 8]).is_none());
        assert!(table.get(&[0x02; 8]).is_none());
        assert!(table.get(&[0x03; 8]).is_some());

        // 任何终止路径都把会话标记为 Expired；重复移除是 no-op
        assert_eq!(first.state(), SessionState::Expired);
        assert_eq!(second.state(), SessionState::Fresh);
        assert!(!table.remove_session(&first));
    }

    #[tokio::test]
    async fn test_touch_detects_migration() {
        let session = test_session("1.2.3.4:50000").await;

        assert_eq!(session.touch("1.2.3.4:50000".parse().unwrap()), None);
        let old = session.touch("5.6.7.8:60000".parse().unwrap());
        assert_eq!(old, Some("1.2.3.4:50000".parse().unwrap()));
        assert_eq!(session.client_addr(), "5.6.7.8:60000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_state_machine() {
        let session = test_session("1.2.3.4:50000").await;
        assert_eq!(session.state(), SessionState::Fresh);

        session.mark_active();
        assert_eq!(session.state(), SessionState::Active);

        assert!(session.mark_expired());
        assert!(!session.mark_expired());
        assert_eq!(session.state(), SessionState::Expired);
    }

    #[tokio::test]
    async fn test_expire_idle_removes_all_cids() {
        let table = SessionTable::new();
        let session = test_session("1.2.3.4:50000").await;

        table.insert_if_absent(Bytes::from_static(&[0x01; 8]), &session);
        table.insert_if_absent(Bytes::from_static(&[0x02; 16]), &session);
        table.insert_if_absent(Bytes::from_static(&[0x02; 8]), &session);

        // 零超时：立即过期
        let removed = table.expire_idle(Duration::from_secs(0));
        assert_eq!(removed, 1);
        assert!(table.is_empty());
        assert_eq!(session.state(), SessionState::Expired);
    }

    #[tokio::test]
    async fn test_expire_idle_keeps_fresh_sessions() {
        let table = SessionTable::new();
        let session = test_session("1.2.3.4:50000").await;
        table.insert_if_absent(Bytes::from_static(&[0x01; 8]), &session);

        let removed = table.expire_idle(Duration::from_secs(3600));
        assert_eq!(removed, 0);
        assert_eq!(table.len(), 1);
    }
}
