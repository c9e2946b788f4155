// =============================================================================
// Settlement contract read — payoutDenominator(bytes32) via eth_call
// =============================================================================
//
// The engine makes exactly one view call: reading the payout denominator for
// a condition id on the Conditional-Tokens contract. A non-zero denominator
// means the market has reported payouts on-chain and the shares are
// redeemable. The calldata is assembled by hand (4-byte selector + one
// 32-byte argument) and sent as a raw `eth_call` JSON-RPC request.
// =============================================================================

use anyhow::{bail, Context, Result};
use ethers_core::types::U256;
use ethers_core::utils::keccak256;

/// ABI signature of the public `payoutDenominator` mapping getter.
const PAYOUT_DENOMINATOR_SIG: &str = "payoutDenominator(bytes32)";

/// Decode a condition id ("0x"-prefixed or bare hex) into its 32 bytes.
pub fn decode_condition_id(condition_id: &str) -> Result<[u8; 32]> {
    let stripped = condition_id.trim().trim_start_matches("0x");
    let bytes = hex::decode(stripped)
        .with_context(|| format!("condition id is not valid hex: {condition_id}"))?;
    if bytes.len() != 32 {
        bail!(
            "condition id must be 32 bytes, got {} ({condition_id})",
            bytes.len()
        );
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Build the `eth_call` data field for `payoutDenominator(conditionId)`.
pub fn payout_denominator_calldata(condition_id: &str) -> Result<String> {
    let arg = decode_condition_id(condition_id)?;
    let selector = &keccak256(PAYOUT_DENOMINATOR_SIG.as_bytes())[..4];

    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(selector);
    data.extend_from_slice(&arg);
    Ok(format!("0x{}", hex::encode(data)))
}

/// Parse the hex-encoded 32-byte return value of the call into an integer.
pub fn parse_denominator(result_hex: &str) -> Result<u128> {
    let stripped = result_hex.trim().trim_start_matches("0x");
    if stripped.is_empty() {
        return Ok(0);
    }
    let value = U256::from_str_radix(stripped, 16)
        .with_context(|| format!("eth_call returned non-numeric payload: {result_hex}"))?;
    if value.bits() > 128 {
        bail!("payout denominator exceeds u128: {value}");
    }
    Ok(value.as_u128())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const CONDITION: &str =
        "0x1111111111111111111111111111111111111111111111111111111111111111";

    #[test]
    fn calldata_is_selector_plus_argument() {
        let data = payout_denominator_calldata(CONDITION).unwrap();
        // "0x" + 4 selector bytes + 32 argument bytes, hex-encoded.
        assert_eq!(data.len(), 2 + 2 * (4 + 32));
        assert!(data.starts_with("0x"));
        assert!(data.ends_with(&CONDITION[2..]));

        let expected_selector = hex::encode(&keccak256(PAYOUT_DENOMINATOR_SIG.as_bytes())[..4]);
        assert_eq!(&data[2..10], expected_selector.as_str());
    }

    #[test]
    fn condition_id_without_prefix_is_accepted() {
        let bare = &CONDITION[2..];
        assert!(payout_denominator_calldata(bare).is_ok());
    }

    #[test]
    fn short_condition_id_is_rejected() {
        assert!(payout_denominator_calldata("0x1234").is_err());
        assert!(payout_denominator_calldata("not-hex").is_err());
    }

    #[test]
    fn parse_zero_and_nonzero_denominators() {
        let zero = format!("0x{}", "0".repeat(64));
        assert_eq!(parse_denominator(&zero).unwrap(), 0);

        let mut one = "0".repeat(63);
        one.push('1');
        assert_eq!(parse_denominator(&format!("0x{one}")).unwrap(), 1);

        assert_eq!(parse_denominator("0x").unwrap(), 0);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_denominator("0xzz").is_err());
    }
}
