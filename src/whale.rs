//! Tracked-wallet trade detection on the deduplicated transaction stream.
//!
//! A transaction whose fee payer is one of the tracked wallets is classified
//! by the payer's token balance deltas: tokens gained means a buy, and a buy
//! large enough (and not of a stable/wrapped asset) becomes a `BuySignal`
//! for the execution layer.

use crate::events::{BuySignal, TokenBalanceDelta, TransactionEvent};
use log::debug;
use solana_sdk::native_token::LAMPORTS_PER_SOL;
use solana_sdk::pubkey::Pubkey;
use std::collections::{HashSet, VecDeque};

/// How many recently signalled mints to remember. A tracked wallet firing
/// rapid consecutive buys of the same token yields one signal, not many.
const RECENT_MINT_WINDOW: usize = 500;

#[derive(Debug, Clone)]
pub struct WhaleConfig {
    pub tracked_wallets: HashSet<Pubkey>,
    /// Buys below this size (in SOL) are ignored.
    pub min_buy_sol: f64,
    /// Stable/wrapped assets that never produce signals.
    pub excluded_mints: HashSet<Pubkey>,
}

pub struct WhaleSignalDetector {
    config: WhaleConfig,
    recent_mints: VecDeque<Pubkey>,
    recent_lookup: HashSet<Pubkey>,
    signals_emitted: u64,
}

impl WhaleSignalDetector {
    pub fn new(config: WhaleConfig) -> Self {
        Self {
            config,
            recent_mints: VecDeque::with_capacity(RECENT_MINT_WINDOW),
            recent_lookup: HashSet::with_capacity(RECENT_MINT_WINDOW),
            signals_emitted: 0,
        }
    }

    pub fn signals_emitted(&self) -> u64 {
        self.signals_emitted
    }

    /// Classify one deduplicated transaction. Returns a signal for a
    /// qualifying buy, None otherwise.
    pub fn observe(&mut self, tx: &TransactionEvent) -> Option<BuySignal> {
        if tx.failed {
            return None;
        }
        let payer = tx.fee_payer?;
        if !self.config.tracked_wallets.contains(&payer) {
            return None;
        }

        let buy = Self::classify_buy(&payer, &tx.balance_deltas)?;
        if self.config.excluded_mints.contains(&buy.mint) {
            debug!("ignoring tracked buy of excluded mint {}", buy.mint);
            return None;
        }

        let size_sol = tx.lamports_spent.max(0) as f64 / LAMPORTS_PER_SOL as f64;
        if size_sol < self.config.min_buy_sol {
            debug!(
                "tracked buy below minimum | wallet={payer} | mint={} | size={size_sol:.4}",
                buy.mint
            );
            return None;
        }

        if !self.remember(buy.mint) {
            debug!("suppressing repeat signal for mint {}", buy.mint);
            return None;
        }

        self.signals_emitted += 1;
        Some(BuySignal {
            wallet: payer,
            mint: buy.mint,
            size_sol,
            tokens: buy.change().max(0) as u64,
            decimals: buy.decimals,
            signature: tx.signature_b58(),
        })
    }

    /// The payer's largest positive token delta is the token they bought.
    fn classify_buy<'a>(
        payer: &Pubkey,
        deltas: &'a [TokenBalanceDelta],
    ) -> Option<&'a TokenBalanceDelta> {
        deltas
            .iter()
            .filter(|d| d.owner == *payer && d.change() > 0)
            .max_by_key(|d| d.change())
    }

    /// Returns false when the mint was signalled within the window.
    fn remember(&mut self, mint: Pubkey) -> bool {
        if self.recent_lookup.contains(&mint) {
            return false;
        }
        if self.recent_mints.len() >= RECENT_MINT_WINDOW {
            if let Some(evicted) = self.recent_mints.pop_front() {
                self.recent_lookup.remove(&evicted);
            }
        }
        self.recent_mints.push_back(mint);
        self.recent_lookup.insert(mint);
        true
    }
}
