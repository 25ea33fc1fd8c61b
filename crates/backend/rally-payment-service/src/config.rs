use std::env;

use chrono::FixedOffset;

use crate::error::PaymentError;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub stripe: StripeConfig,
    pub billing: BillingConfig,
    pub store: StoreConfig,
    pub sheets: SheetsConfig,
    pub push: PushConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_id: String,
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Connected payout accounts, order-significant: transfer amounts in
    /// requests are paired with these positionally.
    pub connected_account_ids: Vec<String>,
    pub monthly_price_cents: i64,
    /// Reference timezone for the date-only renewal comparison. An
    /// explicit configured offset, never the host zone, so renewal timing
    /// stays deterministic wherever the service runs.
    pub reference_offset: FixedOffset,
    pub renewal_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub database_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub webapp_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub vapid_subject: Option<String>,
    pub vapid_private_key: Option<String>,
}

const DEFAULT_MONTHLY_PRICE_CENTS: i64 = 1000;
const DEFAULT_RENEWAL_CONCURRENCY: usize = 8;

impl Config {
    pub fn from_env() -> Result<Self, PaymentError> {
        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("PORT", 3004)?,
            },
            stripe: StripeConfig {
                secret_key: required("STRIPE_SECRET_KEY")?,
                webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
                price_id: required("STRIPE_PRICE_ID")?,
            },
            billing: BillingConfig {
                connected_account_ids: parse_account_ids(
                    &optional("CONNECTED_ACCOUNT_IDS").unwrap_or_default(),
                ),
                monthly_price_cents: parse_var(
                    "MONTHLY_PRICE_IN_CENTS",
                    DEFAULT_MONTHLY_PRICE_CENTS,
                )?,
                reference_offset: reference_offset_from_minutes(parse_var(
                    "RENEWAL_UTC_OFFSET_MINUTES",
                    0,
                )?)?,
                renewal_concurrency: parse_var(
                    "RENEWAL_CONCURRENCY",
                    DEFAULT_RENEWAL_CONCURRENCY,
                )?,
            },
            store: StoreConfig {
                database_url: required("FIREBASE_DATABASE_URL")?,
                database_secret: optional("FIREBASE_DATABASE_SECRET"),
            },
            sheets: SheetsConfig {
                webapp_url: optional("SHEETS_WEBAPP_URL"),
            },
            push: PushConfig {
                vapid_subject: optional("VAPID_SUBJECT"),
                vapid_private_key: optional("VAPID_PRIVATE_KEY"),
            },
        })
    }
}

fn required(name: &'static str) -> Result<String, PaymentError> {
    env::var(name)
        .map_err(|_| PaymentError::Config(format!("{name} environment variable must be set")))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, PaymentError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| PaymentError::Config(format!("Invalid {name} value: {raw}"))),
        Err(_) => Ok(default),
    }
}

/// Comma-separated, order-significant; blanks around commas are tolerated.
pub fn parse_account_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn reference_offset_from_minutes(minutes: i32) -> Result<FixedOffset, PaymentError> {
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| {
            PaymentError::Config(format!(
                "RENEWAL_UTC_OFFSET_MINUTES out of range: {minutes}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_ids_are_split_in_order() {
        assert_eq!(
            parse_account_ids("acct_a, acct_b ,,acct_c"),
            vec!["acct_a", "acct_b", "acct_c"]
        );
        assert!(parse_account_ids("").is_empty());
    }

    #[test]
    fn reference_offset_accepts_sane_values() {
        // EST is UTC-5.
        let est = reference_offset_from_minutes(-300).unwrap();
        assert_eq!(est.local_minus_utc(), -300 * 60);
        assert!(reference_offset_from_minutes(24 * 60).is_err());
    }

    #[test]
    fn reference_offset_rejects_overflowing_values() {
        assert!(reference_offset_from_minutes(i32::MAX).is_err());
        assert!(reference_offset_from_minutes(i32::MIN).is_err());
    }
}
