//! Credit Plans
//!
//! What a customer can buy and how many credits each purchase grants.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{PaymentError, Result};

/// Price per credit for custom top-ups, in cents
pub const TOPUP_CENTS_PER_CREDIT: i64 = 4;

/// Largest custom top-up
pub const MAX_TOPUP_CREDITS: i64 = 1_000_000;

/// Billing interval
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    OneTime,
    Monthly,
}

/// Pricing information
#[derive(Clone, Debug)]
pub struct PlanPricing {
    pub name: String,
    pub description: String,
    pub credits: i64,
    pub cents: i64,
    pub interval: BillingInterval,
}

/// Purchasable credit plans
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Plan {
    Starter,
    Growth,
    Pro,

    /// Arbitrary credit amount at the top-up rate
    TopUp { credits: i64 },
}

impl Plan {
    /// Encode for checkout metadata
    pub fn as_metadata(&self) -> String {
        match self {
            Self::Starter => "starter".into(),
            Self::Growth => "growth".into(),
            Self::Pro => "pro".into(),
            Self::TopUp { credits } => format!("topup:{credits}"),
        }
    }

    /// Decode from checkout metadata
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "starter" => Ok(Self::Starter),
            "growth" => Ok(Self::Growth),
            "pro" => Ok(Self::Pro),
            other => {
                let credits = other
                    .strip_prefix("topup:")
                    .and_then(|n| n.parse::<i64>().ok())
                    .filter(|n| (1..=MAX_TOPUP_CREDITS).contains(n))
                    .ok_or_else(|| PaymentError::InvalidPlan(other.to_string()))?;
                Ok(Self::TopUp { credits })
            }
        }
    }

    /// Get pricing for this plan
    pub fn pricing(&self) -> PlanPricing {
        match self {
            Self::Starter => PlanPricing {
                name: "Starter Credits".into(),
                description: "500 agent credits".into(),
                credits: 500,
                cents: 2000, // $20
                interval: BillingInterval::OneTime,
            },
            Self::Growth => PlanPricing {
                name: "Growth Credits".into(),
                description: "1,500 agent credits".into(),
                credits: 1500,
                cents: 5000, // $50
                interval: BillingInterval::OneTime,
            },
            Self::Pro => PlanPricing {
                name: "Pro Subscription".into(),
                description: "2,500 agent credits every month".into(),
                credits: 2500,
                cents: 7900, // $79/month
                interval: BillingInterval::Monthly,
            },
            Self::TopUp { credits } => PlanPricing {
                name: "Credit Top-Up".into(),
                description: format!("{credits} agent credits"),
                credits: *credits,
                cents: credits.saturating_mul(TOPUP_CENTS_PER_CREDIT),
                interval: BillingInterval::OneTime,
            },
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.pricing().interval != BillingInterval::OneTime
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_metadata())
    }
}

impl Serialize for Plan {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_metadata())
    }
}

impl<'de> Deserialize<'de> for Plan {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_pricing() {
        let pricing = Plan::Starter.pricing();
        assert_eq!(pricing.cents, 2000);
        assert_eq!(pricing.credits, 500);
        assert_eq!(pricing.interval, BillingInterval::OneTime);
        assert!(Plan::Pro.is_recurring());
    }

    #[test]
    fn test_topup_metadata() {
        let plan = Plan::parse("topup:1200").unwrap();
        assert_eq!(plan, Plan::TopUp { credits: 1200 });
        assert_eq!(plan.as_metadata(), "topup:1200");
        assert_eq!(plan.pricing().cents, 4800);
    }

    #[test]
    fn test_unknown_plan_is_rejected() {
        assert!(Plan::parse("enterprise").is_err());
        assert!(Plan::parse("topup:0").is_err());
        assert!(Plan::parse("topup:abc").is_err());
        assert!(Plan::parse("topup:1000000").is_ok());
        assert!(Plan::parse("topup:1000001").is_err());
        assert!(Plan::parse(&format!("topup:{}", i64::MAX)).is_err());
    }

    #[test]
    fn test_plan_serde() {
        let json = serde_json::to_string(&Plan::Growth).unwrap();
        assert_eq!(json, "\"growth\"");
        let plan: Plan = serde_json::from_str("\"topup:50\"").unwrap();
        assert_eq!(plan, Plan::TopUp { credits: 50 });
    }
}
