//! 进程内支付事件总线
//!
//! 由组合根构造并注入，不是模块级单例；测试可以为每个用例
//! 构造独立实例。无持久化、无跨进程投递，订阅者在进程生命
//! 周期内至少收到一次。

use crate::domain::errors::DomainResult;
use crate::domain::events::{EventType, PaymentEvent};
use futures::future::{join_all, BoxFuture};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error};

/// 订阅键：具体事件类型或通配符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    Type(EventType),
    /// 通配符 "*"，接收全部事件
    All,
}

/// 注销处理器用的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type EventHandlerFn = Arc<dyn Fn(PaymentEvent) -> BoxFuture<'static, DomainResult<()>> + Send + Sync>;

struct Registered {
    id: HandlerId,
    name: String,
    handler: EventHandlerFn,
}

/// 事件总线：事件类型（含通配符）到异步处理器集合的注册表
pub struct EventBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventFilter, Vec<Registered>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// 注册处理器，返回可用于注销的句柄。name 只用于日志。
    pub fn register<F, Fut>(&self, filter: EventFilter, name: &str, handler: F) -> HandlerId
    where
        F: Fn(PaymentEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DomainResult<()>> + Send + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: EventHandlerFn = Arc::new(move |event| Box::pin(handler(event)));
        let mut map = self.handlers.write().expect("event bus lock poisoned");
        map.entry(filter).or_default().push(Registered {
            id,
            name: name.to_string(),
            handler,
        });
        debug!(handler = name, "event handler registered");
        id
    }

    /// 注销处理器。句柄不存在时返回 false
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut map = self.handlers.write().expect("event bus lock poisoned");
        for list in map.values_mut() {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// 派发事件。
    ///
    /// 类型处理器与通配符处理器并发执行；单个处理器失败只记录
    /// 日志，不影响其余处理器，也不向发布方传播。所有处理器都被
    /// 执行过一次后本调用才返回——慢订阅者会拖慢 webhook 响应，
    /// 这是给提供方的背压信号。
    pub async fn emit(&self, event: PaymentEvent) {
        let targets: Vec<(String, EventHandlerFn)> = {
            let map = self.handlers.read().expect("event bus lock poisoned");
            let mut targets = Vec::new();
            for filter in [EventFilter::Type(event.event_type), EventFilter::All] {
                if let Some(list) = map.get(&filter) {
                    for r in list {
                        targets.push((r.name.clone(), Arc::clone(&r.handler)));
                    }
                }
            }
            targets
        };

        if targets.is_empty() {
            debug!(event_type = %event.event_type, "no handlers registered for event");
            return;
        }

        let futures = targets.into_iter().map(|(name, handler)| {
            let event = event.clone();
            async move { (name, handler(event).await) }
        });

        for (name, result) in join_all(futures).await {
            if let Err(e) = result {
                error!(
                    handler = %name,
                    event_type = %event.event_type,
                    order_id = %event.order_id,
                    error = %e,
                    "event handler failed"
                );
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
