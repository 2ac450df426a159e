//! Fixed-layout account decoders.
//!
//! These layouts belong to an external on-chain program and are version
//! pinned; a layout change upstream is a breaking external event. Decoding is
//! therefore defensive: every read is length checked and a short buffer is a
//! `MalformedAccount`, never a panic.

use solana_sdk::native_token::LAMPORTS_PER_SOL;
use thiserror::Error;

/// Minimum bonding-curve account size: 8-byte discriminator, four u64 reserve
/// fields plus total supply, one trailing bool.
pub const CURVE_MIN_LEN: usize = 49;

/// SPL token account: the amount field sits at offset 64.
const TOKEN_AMOUNT_OFFSET: usize = 64;
pub const TOKEN_ACCOUNT_MIN_LEN: usize = 72;

pub type DecodeResult<T> = Result<T, DecodeError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed account: need {expected} bytes, got {actual}")]
    MalformedAccount { expected: usize, actual: usize },
}

/// Read a u64 from a byte slice at the given offset (little-endian).
/// Returns None if there aren't enough bytes.
#[inline]
fn read_u64_le(data: &[u8], offset: usize) -> Option<u64> {
    if data.len() < offset + 8 {
        return None;
    }
    let bytes: [u8; 8] = data[offset..offset + 8].try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

#[inline]
fn read_bool(data: &[u8], offset: usize) -> Option<bool> {
    data.get(offset).map(|&b| b != 0)
}

/// Decoded bonding-curve state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurveState {
    pub virtual_token_reserves: u64,
    pub virtual_sol_reserves: u64,
    pub real_token_reserves: u64,
    pub real_sol_reserves: u64,
    /// Set once the curve has graduated to an AMM pool.
    pub complete: bool,
}

impl CurveState {
    /// Price of one whole token in SOL, from the virtual reserves.
    ///
    /// Returns None when either virtual reserve is zero - a zero reserve is
    /// not a valid price, and callers must not treat it as one.
    pub fn price(&self, decimals: u8) -> Option<f64> {
        if self.virtual_token_reserves == 0 || self.virtual_sol_reserves == 0 {
            return None;
        }
        let ratio = self.virtual_sol_reserves as f64 / self.virtual_token_reserves as f64;
        Some(ratio * 10f64.powi(decimals as i32) / LAMPORTS_PER_SOL as f64)
    }
}

/// Decode a bonding-curve account snapshot.
///
/// Layout after the 8-byte discriminator:
/// - virtual_token_reserves: u64 at offset 8
/// - virtual_sol_reserves:   u64 at offset 16
/// - real_token_reserves:    u64 at offset 24
/// - real_sol_reserves:      u64 at offset 32
/// - complete:               bool at offset 48
pub fn decode_curve(data: &[u8]) -> DecodeResult<CurveState> {
    if data.len() < CURVE_MIN_LEN {
        return Err(DecodeError::MalformedAccount {
            expected: CURVE_MIN_LEN,
            actual: data.len(),
        });
    }

    // Length is verified above; the reads cannot fail.
    let virtual_token_reserves = read_u64_le(data, 8).unwrap_or(0);
    let virtual_sol_reserves = read_u64_le(data, 16).unwrap_or(0);
    let real_token_reserves = read_u64_le(data, 24).unwrap_or(0);
    let real_sol_reserves = read_u64_le(data, 32).unwrap_or(0);
    let complete = read_bool(data, 48).unwrap_or(false);

    Ok(CurveState {
        virtual_token_reserves,
        virtual_sol_reserves,
        real_token_reserves,
        real_sol_reserves,
        complete,
    })
}

/// Decode the raw amount out of an SPL token-account snapshot.
///
/// Serves both pool-vault balances and wallet token-account balances (the
/// latter used to detect tokens arriving in the destination wallet).
pub fn decode_token_account_amount(data: &[u8]) -> DecodeResult<u64> {
    match read_u64_le(data, TOKEN_AMOUNT_OFFSET) {
        Some(amount) if data.len() >= TOKEN_ACCOUNT_MIN_LEN => Ok(amount),
        _ => Err(DecodeError::MalformedAccount {
            expected: TOKEN_ACCOUNT_MIN_LEN,
            actual: data.len(),
        }),
    }
}

/// Price of one whole token in SOL from a vault pair.
///
/// `base_amount` is the token vault (token units), `quote_amount` the SOL
/// vault (lamports). Returns None when either side is zero.
pub fn vault_pair_price(base_amount: u64, quote_amount: u64, decimals: u8) -> Option<f64> {
    if base_amount == 0 || quote_amount == 0 {
        return None;
    }
    let ratio = quote_amount as f64 / base_amount as f64;
    Some(ratio * 10f64.powi(decimals as i32) / LAMPORTS_PER_SOL as f64)
}
