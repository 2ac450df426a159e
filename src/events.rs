use smallvec::SmallVec;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;

/// Which decoder produced a price observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    /// Derived from bonding-curve virtual reserves.
    Curve,
    /// Derived from a liquidity-pool vault pair.
    Vault,
}

impl std::fmt::Display for PriceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriceSource::Curve => write!(f, "curve"),
            PriceSource::Vault => write!(f, "vault"),
        }
    }
}

/// Which side of a vault pair an account update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultSide {
    Base,
    Quote,
}

/// One decoded frame coming off a stream connection.
///
/// Connections never emit errors on this channel - protocol and transport
/// failures are handled inside the connection layer.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A bonding-curve account update decoded into a price.
    Price(PriceTick),
    /// A vault token-account balance update (one side of a pool).
    VaultBalance {
        mint: Pubkey,
        side: VaultSide,
        amount: u64,
        decimals: u8,
        slot: u64,
        endpoint: Arc<str>,
    },
    /// The operator wallet's token account for a tracked mint changed.
    WalletBalance {
        mint: Pubkey,
        amount: u64,
        slot: u64,
        endpoint: Arc<str>,
    },
    /// A transaction touching the tracked-wallet filter.
    Transaction(TransactionEvent),
}

#[derive(Debug, Clone)]
pub struct PriceTick {
    pub mint: Pubkey,
    /// Price of one whole token in SOL.
    pub price: f64,
    pub source: PriceSource,
    /// Curve graduation flag, when the source is a bonding curve.
    pub complete: bool,
    pub slot: u64,
    pub endpoint: Arc<str>,
}

/// Summary of a transaction delivered by the stream, reduced to what the
/// whale detector needs: who paid, what token balances moved, how much SOL
/// left the payer.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub signature: Vec<u8>,
    pub fee_payer: Option<Pubkey>,
    /// Lamports that left the fee payer's account (fees included). Negative
    /// when the payer received lamports, e.g. on a sell.
    pub lamports_spent: i64,
    pub balance_deltas: SmallVec<[TokenBalanceDelta; 4]>,
    pub failed: bool,
    pub slot: u64,
    pub endpoint: Arc<str>,
}

impl TransactionEvent {
    pub fn signature_b58(&self) -> String {
        bs58::encode(&self.signature).into_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBalanceDelta {
    pub owner: Pubkey,
    pub mint: Pubkey,
    pub pre_amount: u64,
    pub post_amount: u64,
    pub decimals: u8,
}

impl TokenBalanceDelta {
    /// Raw token delta, positive when the owner gained tokens.
    pub fn change(&self) -> i128 {
        self.post_amount as i128 - self.pre_amount as i128
    }
}

/// Why the risk engine decided to exit a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    Stagnation,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop-loss"),
            ExitReason::TakeProfit => write!(f, "take-profit"),
            ExitReason::TrailingStop => write!(f, "trailing-stop"),
            ExitReason::Stagnation => write!(f, "stagnation"),
        }
    }
}

/// Emitted at most once per risk record. Consumed by the execution layer.
#[derive(Debug, Clone)]
pub struct ExitCommand {
    pub mint: Pubkey,
    pub reason: ExitReason,
    pub price: f64,
    /// Fractional PnL relative to entry, e.g. -0.21 for a 21% loss.
    pub pnl: f64,
}

/// A tracked wallet bought a token above the configured minimum size.
#[derive(Debug, Clone)]
pub struct BuySignal {
    pub wallet: Pubkey,
    pub mint: Pubkey,
    pub size_sol: f64,
    /// Raw token amount the wallet received.
    pub tokens: u64,
    pub decimals: u8,
    pub signature: String,
}

impl BuySignal {
    /// SOL the wallet paid per whole token. None when the trade carries no
    /// usable size.
    pub fn price_paid(&self) -> Option<f64> {
        if self.tokens == 0 {
            return None;
        }
        let whole_tokens = self.tokens as f64 / 10f64.powi(self.decimals as i32);
        let price = self.size_sol / whole_tokens;
        (price.is_finite() && price > 0.0).then_some(price)
    }
}
