//! 恒定乘积联合曲线的整数算法，结果需与链上程序逐位一致。

/// 初始虚拟输入储备（30 SOL，lamports）。
pub const INITIAL_VIRTUAL_INPUT_RESERVE: u64 = 30_000_000_000;
/// 初始虚拟资产储备（1.073B，6 位精度）。
pub const INITIAL_VIRTUAL_OUTPUT_RESERVE: u64 = 1_073_000_000_000_000;
/// 曲线上可售的真实资产数量。
pub const INITIAL_REAL_OUTPUT_RESERVE: u64 = 793_100_000_000_000;
/// 毕业阈值（85 SOL，lamports）。
pub const GRADUATION_THRESHOLD: u64 = 85_000_000_000;
pub const PLATFORM_FEE_BPS: u16 = 100;
pub const BPS_DENOMINATOR: u16 = 10_000;

const INPUT_UNITS_PER_WHOLE: f64 = 1e9;
const OUTPUT_UNITS_PER_WHOLE: f64 = 1e6;

/// 曲线计算错误。
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CurveError {
    #[error("数量必须大于 0")]
    InvalidAmount,
    #[error("曲线储备不能为 0")]
    DegenerateCurve,
    #[error("整数运算溢出")]
    Overflow,
    #[error("基点超出范围: {0}")]
    InvalidBasisPoints(u16),
}

fn ensure_reserves(input_reserve: u64, output_reserve: u64) -> Result<(), CurveError> {
    if input_reserve == 0 || output_reserve == 0 {
        return Err(CurveError::DegenerateCurve);
    }
    Ok(())
}

fn ensure_amount(amount: u64) -> Result<(), CurveError> {
    if amount == 0 {
        return Err(CurveError::InvalidAmount);
    }
    Ok(())
}

fn ensure_bps(bps: u16) -> Result<(), CurveError> {
    if bps > BPS_DENOMINATOR {
        return Err(CurveError::InvalidBasisPoints(bps));
    }
    Ok(())
}

fn to_u64(value: u128) -> Result<u64, CurveError> {
    u64::try_from(value).map_err(|_| CurveError::Overflow)
}

/// 买入：给定扣费后的输入数量，返回可获得的资产数量。
///
/// `output_reserve - floor(k / (input_reserve + input_amount))`，中间值使用 u128。
pub fn quote_output(
    input_reserve: u64,
    output_reserve: u64,
    input_amount: u64,
) -> Result<u64, CurveError> {
    ensure_reserves(input_reserve, output_reserve)?;
    ensure_amount(input_amount)?;
    let reserve_in = input_reserve as u128;
    let reserve_out = output_reserve as u128;
    let k = reserve_in
        .checked_mul(reserve_out)
        .ok_or(CurveError::Overflow)?;
    let next_in = reserve_in
        .checked_add(input_amount as u128)
        .ok_or(CurveError::Overflow)?;
    let next_out = k.checked_div(next_in).ok_or(CurveError::DegenerateCurve)?;
    let out = reserve_out
        .checked_sub(next_out)
        .ok_or(CurveError::Overflow)?;
    to_u64(out)
}

/// 卖出：给定卖回的资产数量，返回扣费前可取回的输入数量。
pub fn quote_input(
    input_reserve: u64,
    output_reserve: u64,
    output_amount: u64,
) -> Result<u64, CurveError> {
    ensure_reserves(input_reserve, output_reserve)?;
    ensure_amount(output_amount)?;
    let reserve_in = input_reserve as u128;
    let reserve_out = output_reserve as u128;
    let k = reserve_in
        .checked_mul(reserve_out)
        .ok_or(CurveError::Overflow)?;
    let next_out = reserve_out
        .checked_add(output_amount as u128)
        .ok_or(CurveError::Overflow)?;
    let next_in = k.checked_div(next_out).ok_or(CurveError::DegenerateCurve)?;
    let input = reserve_in
        .checked_sub(next_in)
        .ok_or(CurveError::Overflow)?;
    to_u64(input)
}

/// 扣除平台手续费，返回 `(扣费后数量, 手续费)`；手续费向下取整。
pub fn deduct_fee(amount: u64, fee_bps: u16) -> Result<(u64, u64), CurveError> {
    ensure_amount(amount)?;
    ensure_bps(fee_bps)?;
    let fee = (amount as u128)
        .checked_mul(fee_bps as u128)
        .ok_or(CurveError::Overflow)?
        / BPS_DENOMINATOR as u128;
    let fee = to_u64(fee)?;
    let after_fee = amount.checked_sub(fee).ok_or(CurveError::Overflow)?;
    Ok((after_fee, fee))
}

/// 按滑点容忍度计算最低可接受数量。
pub fn apply_slippage(expected_amount: u64, tolerance_bps: u16) -> Result<u64, CurveError> {
    ensure_amount(expected_amount)?;
    ensure_bps(tolerance_bps)?;
    let keep = (BPS_DENOMINATOR - tolerance_bps) as u128;
    let minimum = (expected_amount as u128)
        .checked_mul(keep)
        .ok_or(CurveError::Overflow)?
        / BPS_DENOMINATOR as u128;
    to_u64(minimum)
}

/// 链上一次成交的完整结果，输入侧均为输入货币单位。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeOutcome {
    /// 输入货币总额（买入为付出总额，卖出为扣费前取回总额）。
    pub gross_input: u64,
    /// 进入或离开曲线的净输入数量。
    pub curve_input: u64,
    pub fee: u64,
    pub output_amount: u64,
    pub virtual_input_after: u64,
    pub virtual_output_after: u64,
}

/// 按链上顺序模拟买入：先扣手续费，再走曲线。
pub fn simulate_buy(
    input_reserve: u64,
    output_reserve: u64,
    gross_input: u64,
    fee_bps: u16,
) -> Result<TradeOutcome, CurveError> {
    let (curve_input, fee) = deduct_fee(gross_input, fee_bps)?;
    let output_amount = quote_output(input_reserve, output_reserve, curve_input)?;
    Ok(TradeOutcome {
        gross_input,
        curve_input,
        fee,
        output_amount,
        virtual_input_after: input_reserve
            .checked_add(curve_input)
            .ok_or(CurveError::Overflow)?,
        virtual_output_after: output_reserve
            .checked_sub(output_amount)
            .ok_or(CurveError::Overflow)?,
    })
}

/// 按链上顺序模拟卖出：先走曲线，再从取回的输入货币中扣费。
pub fn simulate_sell(
    input_reserve: u64,
    output_reserve: u64,
    output_amount: u64,
    fee_bps: u16,
) -> Result<TradeOutcome, CurveError> {
    let gross_input = quote_input(input_reserve, output_reserve, output_amount)?;
    let (_, fee) = if gross_input == 0 {
        (0, 0)
    } else {
        deduct_fee(gross_input, fee_bps)?
    };
    Ok(TradeOutcome {
        gross_input,
        curve_input: gross_input,
        fee,
        output_amount,
        virtual_input_after: input_reserve
            .checked_sub(gross_input)
            .ok_or(CurveError::Overflow)?,
        virtual_output_after: output_reserve
            .checked_add(output_amount)
            .ok_or(CurveError::Overflow)?,
    })
}

/// 单位资产的展示价格（整币计价，仅供展示）。
pub fn spot_price(input_reserve: u64, output_reserve: u64) -> Result<f64, CurveError> {
    ensure_reserves(input_reserve, output_reserve)?;
    let input_whole = input_reserve as f64 / INPUT_UNITS_PER_WHOLE;
    let output_whole = output_reserve as f64 / OUTPUT_UNITS_PER_WHOLE;
    Ok(input_whole / output_whole)
}

/// 以当前价格估算的市值（整币计价）。
pub fn market_cap(
    input_reserve: u64,
    output_reserve: u64,
    total_supply: u64,
) -> Result<f64, CurveError> {
    let price = spot_price(input_reserve, output_reserve)?;
    Ok(price * (total_supply as f64 / OUTPUT_UNITS_PER_WHOLE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_quote_output_matches_reference_example() {
        let out = quote_output(30_000_000_000, 1_073_000_000_000_000, 1_000_000_000)
            .expect("报价失败");
        let k = 30_000_000_000u128 * 1_073_000_000_000_000u128;
        let expected = 1_073_000_000_000_000u128 - k / 31_000_000_000u128;
        assert_eq!(out as u128, expected);
        assert_eq!(out, 34_612_903_225_807);
    }

    #[test]
    fn test_deduct_fee_and_slippage() {
        assert_eq!(
            deduct_fee(1_000_000_000, 100).expect("扣费失败"),
            (990_000_000, 10_000_000)
        );
        assert_eq!(apply_slippage(1_000_000, 100).expect("滑点计算失败"), 990_000);
        // 手续费向下取整，偏向协议。
        assert_eq!(deduct_fee(199, 100).expect("扣费失败"), (198, 1));
        assert_eq!(deduct_fee(99, 100).expect("扣费失败"), (99, 0));
    }

    #[test]
    fn test_rejects_invalid_inputs() {
        assert_eq!(quote_output(1, 1, 0), Err(CurveError::InvalidAmount));
        assert_eq!(quote_output(0, 1, 1), Err(CurveError::DegenerateCurve));
        assert_eq!(quote_input(1, 0, 1), Err(CurveError::DegenerateCurve));
        assert_eq!(quote_input(1, 1, 0), Err(CurveError::InvalidAmount));
        assert_eq!(deduct_fee(0, 100), Err(CurveError::InvalidAmount));
        assert_eq!(deduct_fee(1, 10_001), Err(CurveError::InvalidBasisPoints(10_001)));
        assert_eq!(apply_slippage(0, 100), Err(CurveError::InvalidAmount));
    }

    #[test]
    fn test_simulate_buy_overflow_on_post_reserve() {
        let result = simulate_buy(u64::MAX, 1_000, 1_000, 0);
        assert_eq!(result, Err(CurveError::Overflow));
    }

    #[test]
    fn test_simulate_buy_then_sell_costs_fee() {
        let buy = simulate_buy(
            INITIAL_VIRTUAL_INPUT_RESERVE,
            INITIAL_VIRTUAL_OUTPUT_RESERVE,
            1_000_000_000,
            PLATFORM_FEE_BPS,
        )
        .expect("买入模拟失败");
        assert_eq!(buy.fee, 10_000_000);
        assert_eq!(buy.virtual_input_after, 30_990_000_000);

        let sell = simulate_sell(
            buy.virtual_input_after,
            buy.virtual_output_after,
            buy.output_amount,
            PLATFORM_FEE_BPS,
        )
        .expect("卖出模拟失败");
        assert!(sell.gross_input - sell.fee < buy.gross_input);
        assert_eq!(sell.virtual_output_after, INITIAL_VIRTUAL_OUTPUT_RESERVE);
    }

    #[test]
    fn test_graduation_after_repeated_buys() {
        let mut vin = INITIAL_VIRTUAL_INPUT_RESERVE;
        let mut vout = INITIAL_VIRTUAL_OUTPUT_RESERVE;
        let mut real = 0u64;
        let mut buys = 0;
        while real < GRADUATION_THRESHOLD {
            let outcome =
                simulate_buy(vin, vout, 1_000_000_000, PLATFORM_FEE_BPS).expect("买入失败");
            vin = outcome.virtual_input_after;
            vout = outcome.virtual_output_after;
            real += outcome.curve_input;
            buys += 1;
            assert!(buys <= 200);
        }
        assert_eq!(buys, 86);
    }

    #[test]
    fn test_spot_price_rises_after_buy() {
        let before = spot_price(INITIAL_VIRTUAL_INPUT_RESERVE, INITIAL_VIRTUAL_OUTPUT_RESERVE)
            .expect("价格");
        let buy = simulate_buy(
            INITIAL_VIRTUAL_INPUT_RESERVE,
            INITIAL_VIRTUAL_OUTPUT_RESERVE,
            5_000_000_000,
            PLATFORM_FEE_BPS,
        )
        .expect("买入失败");
        let after = spot_price(buy.virtual_input_after, buy.virtual_output_after).expect("价格");
        assert!(after > before);
        assert!(before > 0.0 && before < 0.001);
        assert!(market_cap(buy.virtual_input_after, buy.virtual_output_after, buy.output_amount)
            .expect("市值")
            > 0.0);
    }

    proptest! {
        #[test]
        fn prop_quote_output_monotonic(
            reserve_in in 1_000u64..1_000_000_000_000_000,
            reserve_out in 1_000u64..u64::MAX / 2,
            small in 1u64..1_000_000_000_000,
            extra in 0u64..1_000_000_000_000,
        ) {
            let a = quote_output(reserve_in, reserve_out, small).unwrap();
            let b = quote_output(reserve_in, reserve_out, small + extra).unwrap();
            prop_assert!(b >= a);
            prop_assert!(b <= reserve_out);
        }

        #[test]
        fn prop_sell_recovers_buy_input(
            reserve_in in 1_000_000u64..1_000_000_000_000,
            reserve_out in 1_000_000_000u64..10_000_000_000_000_000,
            input in 1u64..1_000_000_000_000,
        ) {
            let out = quote_output(reserve_in, reserve_out, input).unwrap();
            prop_assume!(out > 0);
            let next_in = reserve_in + input;
            let next_out = reserve_out - out;
            let recovered = quote_input(next_in, next_out, out).unwrap();
            // 取整误差上界为 ceil(next_in / reserve_out)。
            let bound = next_in / reserve_out + 1;
            prop_assert!(recovered >= input);
            prop_assert!(recovered - input <= bound);
        }

        #[test]
        fn prop_fee_never_rounds_up(amount in 1u64..u64::MAX, bps in 0u16..=10_000) {
            let (after, fee) = deduct_fee(amount, bps).unwrap();
            prop_assert_eq!(after + fee, amount);
            prop_assert!((fee as u128) * 10_000 <= (amount as u128) * (bps as u128));
        }
    }
}
