//! 优惠券折扣引擎
//!
//! 纯函数实现：折扣计算与可用性校验都不触达外部系统，
//! 使用快照数据由调用方传入。

use crate::domain::value_objects::OrderType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 折扣类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    /// 按订单金额百分比
    Percentage,
    /// 固定金额（分）
    Fixed,
}

/// 优惠券定义（只读业务配置）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub active: bool,
    pub discount_type: DiscountType,
    /// percentage 时为百分比数值，fixed 时为分
    pub discount_value: i64,
    /// 百分比折扣的封顶金额（分）
    pub max_discount: Option<i64>,
    /// 使用门槛（分）
    pub min_amount: i64,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// 全局可用次数上限
    pub total_usage_limit: Option<u32>,
    /// 单用户可用次数上限
    pub per_user_limit: Option<u32>,
    /// 适用的订单类型，None 表示不限
    pub applicable_types: Option<Vec<OrderType>>,
}

/// 优惠券当前使用情况快照，由调用方读出后传入
#[derive(Debug, Clone, Copy, Default)]
pub struct CouponUsage {
    pub total_used: u32,
    pub used_by_user: u32,
}

/// 校验被拒绝的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponRejection {
    Inactive,
    NotStarted,
    Expired,
    AmountTooLow,
    TotalLimitReached,
    UserLimitReached,
    NotApplicable,
}

impl fmt::Display for CouponRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CouponRejection::Inactive => "coupon is not active",
            CouponRejection::NotStarted => "coupon is not yet valid",
            CouponRejection::Expired => "coupon has expired",
            CouponRejection::AmountTooLow => "order amount below coupon minimum",
            CouponRejection::TotalLimitReached => "coupon usage limit reached",
            CouponRejection::UserLimitReached => "per-user usage limit reached",
            CouponRejection::NotApplicable => "coupon not applicable to this order type",
        };
        f.write_str(s)
    }
}

/// 校验结果。券不可用是常态而非异常，用带标记的结果表达
#[derive(Debug, Clone, Copy)]
pub struct CouponValidation {
    pub valid: bool,
    pub error: Option<CouponRejection>,
}

impl CouponValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn rejected(reason: CouponRejection) -> Self {
        Self {
            valid: false,
            error: Some(reason),
        }
    }
}

/// 计算折扣金额（分）。
///
/// 结果恒满足 0 <= discount <= order_amount：
/// 百分比折扣先按 max_discount 封顶，所有折扣最终不超过订单金额。
pub fn calculate_discount(coupon: &Coupon, order_amount: i64) -> i64 {
    let raw = match coupon.discount_type {
        DiscountType::Percentage => {
            let discount = order_amount * coupon.discount_value / 100;
            match coupon.max_discount {
                Some(cap) => discount.min(cap),
                None => discount,
            }
        }
        DiscountType::Fixed => coupon.discount_value,
    };
    raw.clamp(0, order_amount.max(0))
}

/// 校验优惠券对给定订单是否可用
pub fn validate(
    coupon: &Coupon,
    order_type: OrderType,
    order_amount: i64,
    usage: &CouponUsage,
    now: DateTime<Utc>,
) -> CouponValidation {
    if !coupon.active {
        return CouponValidation::rejected(CouponRejection::Inactive);
    }
    if now < coupon.starts_at {
        return CouponValidation::rejected(CouponRejection::NotStarted);
    }
    if now > coupon.expires_at {
        return CouponValidation::rejected(CouponRejection::Expired);
    }
    if order_amount < coupon.min_amount {
        return CouponValidation::rejected(CouponRejection::AmountTooLow);
    }
    if let Some(limit) = coupon.total_usage_limit {
        if usage.total_used >= limit {
            return CouponValidation::rejected(CouponRejection::TotalLimitReached);
        }
    }
    if let Some(limit) = coupon.per_user_limit {
        if usage.used_by_user >= limit {
            return CouponValidation::rejected(CouponRejection::UserLimitReached);
        }
    }
    if let Some(types) = &coupon.applicable_types {
        if !types.contains(&order_type) {
            return CouponValidation::rejected(CouponRejection::NotApplicable);
        }
    }
    CouponValidation::ok()
}
