//! Affordability check for wallet-funded requests.

use serde::{Deserialize, Serialize};

use crate::entities::PaymentMethod;
use crate::fare::round_to_cents;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Affordability {
    Sufficient,
    InsufficientFunds { missing_amount: f64 },
}

impl Affordability {
    pub fn is_sufficient(&self) -> bool {
        matches!(self, Self::Sufficient)
    }
}

/// Only wallet payments are guarded; cash is settled outside the app.
pub fn check(payment_method: PaymentMethod, balance: f64, price: f64) -> Affordability {
    if payment_method != PaymentMethod::Wallet || balance >= price {
        return Affordability::Sufficient;
    }

    Affordability::InsufficientFunds {
        missing_amount: round_to_cents(price - balance),
    }
}

#[test]
fn wallet_short_of_price() {
    assert_eq!(
        check(PaymentMethod::Wallet, 5.0, 8.0),
        Affordability::InsufficientFunds {
            missing_amount: 3.0
        }
    );
}

#[test]
fn wallet_covering_price() {
    assert!(check(PaymentMethod::Wallet, 8.0, 8.0).is_sufficient());
    assert!(check(PaymentMethod::Wallet, 20.0, 8.0).is_sufficient());
}

#[test]
fn cash_is_never_guarded() {
    assert!(check(PaymentMethod::Cash, 0.0, 8.0).is_sufficient());
}

#[test]
fn missing_amount_is_rounded_to_cents() {
    assert_eq!(
        check(PaymentMethod::Wallet, 0.1, 0.3),
        Affordability::InsufficientFunds {
            missing_amount: 0.2
        }
    );
}
