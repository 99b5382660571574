//! 订阅续费调度器
//!
//! 单实例定时循环：扫描临近到期的订阅，为每个订阅建立唯一的
//! 续费任务，经支付服务发起扣款；失败按指数退避重试，重试耗尽
//! 标记 failed 并以 error 级日志暴露给告警，不再继续调度。

use crate::application::event_bus::EventBus;
use crate::application::payment_service::PaymentService;
use crate::domain::entities::{RenewalTask, RenewalTaskStatus};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::events::{EventType, PaymentEvent};
use crate::ports::{CouponStorePort, OrderStorePort, SubscriptionStorePort};
use chrono::{Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 调度配置
#[derive(Debug, Clone)]
pub struct RenewalConfig {
    /// 扫描间隔
    pub check_interval: std::time::Duration,
    /// 提前多少天开始续费
    pub renewal_advance_days: i64,
    /// 最大尝试次数
    pub max_retries: u32,
    /// 退避基础间隔
    pub retry_base_delay: Duration,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            check_interval: std::time::Duration::from_secs(300),
            renewal_advance_days: 3,
            max_retries: 3,
            retry_base_delay: Duration::seconds(60),
        }
    }
}

impl RenewalConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        let parse = |key: &str, fallback: i64| -> i64 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback)
        };
        Self {
            check_interval: std::time::Duration::from_millis(
                parse("RENEWAL_CHECK_INTERVAL_MS", 300_000).max(1000) as u64,
            ),
            renewal_advance_days: parse("RENEWAL_ADVANCE_DAYS", default.renewal_advance_days),
            max_retries: parse("RENEWAL_MAX_RETRIES", default.max_retries as i64).max(1) as u32,
            retry_base_delay: Duration::seconds(parse(
                "RENEWAL_RETRY_BASE_DELAY_SECS",
                default.retry_base_delay.num_seconds(),
            )),
        }
    }
}

/// 调度器核心：被定时循环与控制面共享
struct SchedulerCore<S, C, U>
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    payments: Arc<PaymentService<S, C>>,
    subscriptions: Arc<U>,
    bus: Arc<EventBus>,
    config: RwLock<RenewalConfig>,
    tasks: Mutex<HashMap<String, RenewalTask>>,
}

impl<S, C, U> SchedulerCore<S, C, U>
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    /// 一轮扫描：建任务、跑到期任务
    async fn run_once(&self) -> DomainResult<()> {
        let config = self.config.read().expect("scheduler lock poisoned").clone();
        let deadline = Utc::now() + Duration::days(config.renewal_advance_days);
        let expiring = self.subscriptions.find_expiring(deadline).await?;
        debug!(count = expiring.len(), "expiring subscriptions scanned");

        // 每个订阅至多一个未终结任务；failed 任务同样挡住新任务，
        // 重试耗尽后只能由运维 trigger_renewal 重新发起
        {
            let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
            for sub in &expiring {
                let blocked = tasks
                    .values()
                    .any(|t| t.subscription_id == sub.id && t.status != RenewalTaskStatus::Success);
                if !blocked {
                    let task = RenewalTask::new(&sub.id);
                    info!(task_id = %task.id, subscription_id = %sub.id, "renewal task created");
                    tasks.insert(task.id.clone(), task);
                }
            }
        }

        let due: Vec<String> = {
            let now = Utc::now();
            let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
            tasks
                .values_mut()
                .filter(|t| t.is_due(now))
                .map(|t| {
                    t.mark_processing();
                    t.id.clone()
                })
                .collect()
        };

        for task_id in due {
            self.process_task(&task_id, &config).await;
        }
        Ok(())
    }

    /// 执行一次续费尝试
    async fn process_task(&self, task_id: &str, config: &RenewalConfig) {
        let subscription_id = match self.task_snapshot(task_id) {
            Some(t) => t.subscription_id,
            None => return,
        };

        let attempt = async {
            let subscription = self
                .subscriptions
                .find_by_id(&subscription_id)
                .await?
                .ok_or_else(|| DomainError::SubscriptionNotFound(subscription_id.clone()))?;
            let order = self.payments.charge_renewal(&subscription).await?;
            Ok::<_, DomainError>((subscription, order))
        }
        .await;

        match attempt {
            Ok((subscription, order)) => {
                let new_period_end =
                    subscription.current_period_end + Duration::days(subscription.period_days);
                if let Err(e) = self
                    .subscriptions
                    .extend_period(&subscription.id, new_period_end)
                    .await
                {
                    error!(subscription_id = %subscription.id, error = %e, "failed to extend subscription period");
                }

                {
                    let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
                    if let Some(task) = tasks.get_mut(task_id) {
                        task.mark_success(order.id.clone());
                    }
                }
                info!(
                    task_id = %task_id,
                    subscription_id = %subscription.id,
                    order_id = %order.id,
                    "subscription renewed"
                );

                let event = PaymentEvent::new(
                    EventType::SubscriptionRenewed,
                    subscription.provider,
                    order.id,
                    subscription.user_id.clone(),
                    json!({
                        "subscription_id": subscription.id,
                        "plan_id": subscription.plan_id,
                        "new_period_end": new_period_end,
                    }),
                );
                self.bus.emit(event).await;
            }
            Err(e) => {
                let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
                if let Some(task) = tasks.get_mut(task_id) {
                    let rescheduled = task.record_failure(
                        e.to_string(),
                        config.max_retries,
                        config.retry_base_delay,
                    );
                    if rescheduled {
                        warn!(
                            task_id = %task_id,
                            subscription_id = %subscription_id,
                            attempts = task.attempts,
                            next_attempt_at = %task.next_attempt_at,
                            error = %e,
                            "renewal attempt failed, rescheduled"
                        );
                    } else {
                        // 告警条件：重试耗尽，订阅将在无人工介入时到期
                        error!(
                            task_id = %task_id,
                            subscription_id = %subscription_id,
                            attempts = task.attempts,
                            error = %e,
                            "renewal retries exhausted, task failed"
                        );
                    }
                }
            }
        }
    }

    fn task_snapshot(&self, task_id: &str) -> Option<RenewalTask> {
        self.tasks
            .lock()
            .expect("scheduler lock poisoned")
            .get(task_id)
            .cloned()
    }
}

/// 续费调度器
pub struct RenewalScheduler<S, C, U>
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    core: Arc<SchedulerCore<S, C, U>>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl<S, C, U> RenewalScheduler<S, C, U>
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    pub fn new(
        payments: Arc<PaymentService<S, C>>,
        subscriptions: Arc<U>,
        bus: Arc<EventBus>,
        config: RenewalConfig,
    ) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                payments,
                subscriptions,
                bus,
                config: RwLock::new(config),
                tasks: Mutex::new(HashMap::new()),
            }),
            runner: Mutex::new(None),
        }
    }

    /// 启动定时循环，运行配置以启动时传入的为准。
    /// 幂等：已在运行时返回 false，不会起第二个循环
    pub fn start(&self, config: RenewalConfig) -> bool {
        let mut runner = self.runner.lock().expect("scheduler lock poisoned");
        if runner.is_some() {
            warn!("renewal scheduler already running");
            return false;
        }

        let interval = config.check_interval;
        *self.core.config.write().expect("scheduler lock poisoned") = config;

        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = core.run_once().await {
                    error!(error = %e, "renewal scan failed");
                }
            }
        });
        *runner = Some(handle);
        info!(interval_ms = interval.as_millis() as u64, "renewal scheduler started");
        true
    }

    /// 停止定时循环。幂等：未运行时返回 false
    pub fn stop(&self) -> bool {
        let mut runner = self.runner.lock().expect("scheduler lock poisoned");
        match runner.take() {
            Some(handle) => {
                handle.abort();
                info!("renewal scheduler stopped");
                true
            }
            None => false,
        }
    }

    /// 手动执行一轮扫描（循环体之外的入口，测试与运维使用）
    pub async fn run_once(&self) -> DomainResult<()> {
        self.core.run_once().await
    }

    /// 手动触发续费。订阅存在未终结任务时复位该任务立即执行，
    /// 否则（含 failed 后的人工重试）新建任务执行。
    pub async fn trigger_renewal(&self, subscription_id: &str) -> DomainResult<RenewalTask> {
        if self
            .core
            .subscriptions
            .find_by_id(subscription_id)
            .await?
            .is_none()
        {
            return Err(DomainError::SubscriptionNotFound(subscription_id.to_string()));
        }

        let config = self
            .core
            .config
            .read()
            .expect("scheduler lock poisoned")
            .clone();
        let task_id = {
            let mut tasks = self.core.tasks.lock().expect("scheduler lock poisoned");
            let existing = tasks
                .values_mut()
                .find(|t| t.subscription_id == subscription_id && t.is_in_flight());
            match existing {
                Some(task) => {
                    task.mark_processing();
                    task.id.clone()
                }
                None => {
                    let mut task = RenewalTask::new(subscription_id);
                    task.mark_processing();
                    let id = task.id.clone();
                    tasks.insert(id.clone(), task);
                    id
                }
            }
        };
        info!(task_id = %task_id, subscription_id = %subscription_id, "renewal triggered manually");

        self.core.process_task(&task_id, &config).await;
        self.core
            .task_snapshot(&task_id)
            .ok_or_else(|| DomainError::TaskNotFound(task_id))
    }

    /// 取消未终结的续费任务
    pub fn cancel_task(&self, task_id: &str) -> DomainResult<RenewalTask> {
        let mut tasks = self.core.tasks.lock().expect("scheduler lock poisoned");
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| DomainError::TaskNotFound(task_id.to_string()))?;
        if !task.is_in_flight() {
            return Err(DomainError::ValidationError(format!(
                "task {} already terminal",
                task_id
            )));
        }
        task.status = RenewalTaskStatus::Failed;
        task.last_error = Some("canceled by operator".to_string());
        task.updated_at = Utc::now();
        info!(task_id = %task_id, "renewal task canceled");
        Ok(task.clone())
    }

    /// 按条件查询任务
    pub fn get_tasks(
        &self,
        status: Option<RenewalTaskStatus>,
        subscription_id: Option<&str>,
    ) -> Vec<RenewalTask> {
        let tasks = self.core.tasks.lock().expect("scheduler lock poisoned");
        tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .filter(|t| subscription_id.map_or(true, |id| t.subscription_id == id))
            .cloned()
            .collect()
    }
}
