use crate::curve::event::TradeSettled;
use crate::curve::math::{quote_input, quote_output};
use crate::types::AssetRecord;

const LOG_TARGET: &str = "curve_indexer::reconciler";

/// 结算校验参数。
#[derive(Debug, Clone, Copy)]
pub struct SettleRules {
    pub reserve_tolerance: u64,
    pub graduation_threshold: u64,
}

fn within(expected: u64, reported: u64, tolerance: u64) -> bool {
    expected.abs_diff(reported) <= tolerance
}

fn check_leg(label: &str, expected: u64, reported: u64, tolerance: u64) -> Result<(), String> {
    if within(expected, reported, tolerance) {
        Ok(())
    } else {
        Err(format!(
            "{} 不一致: 本地推算 {}, 链上 {}, 容差 {}",
            label, expected, reported, tolerance
        ))
    }
}

/// 用当前物化储备复算一笔成交，校验通过后返回更新后的资产。
///
/// 储备以链上报告的成交后数值为准，本地复算只用于发现乱序或陈旧事件。
pub fn settle_asset(
    current: &AssetRecord,
    event: &TradeSettled,
    rules: &SettleRules,
) -> Result<AssetRecord, String> {
    if let Some(last) = current.last_settled_at {
        if event.settled_at < last {
            return Err(format!(
                "结算时间倒退: 事件 {}, 已应用 {}",
                event.settled_at, last
            ));
        }
    }

    let vin = current.virtual_input_reserve;
    let vout = current.virtual_output_reserve;
    let tolerance = rules.reserve_tolerance;
    let mut next = current.clone();

    if event.is_buy {
        let curve_input = event
            .input_amount
            .checked_sub(event.fee_amount)
            .ok_or_else(|| "手续费大于买入金额".to_string())?;
        let expected_out =
            quote_output(vin, vout, curve_input).map_err(|err| format!("复算买入失败: {}", err))?;
        check_leg("买入产出", expected_out, event.output_amount, tolerance)?;
        check_leg(
            "成交后虚拟输入储备",
            vin.saturating_add(curve_input),
            event.virtual_input_after,
            tolerance,
        )?;
        check_leg(
            "成交后虚拟资产储备",
            vout.saturating_sub(expected_out),
            event.virtual_output_after,
            tolerance,
        )?;
        next.real_input_balance = current
            .real_input_balance
            .checked_add(curve_input)
            .ok_or_else(|| "真实余额溢出".to_string())?;
        next.total_output_supply = current
            .total_output_supply
            .checked_add(event.output_amount)
            .ok_or_else(|| "供应量溢出".to_string())?;
    } else {
        let expected_gross = quote_input(vin, vout, event.output_amount)
            .map_err(|err| format!("复算卖出失败: {}", err))?;
        check_leg("卖出取回", expected_gross, event.input_amount, tolerance)?;
        check_leg(
            "成交后虚拟输入储备",
            vin.saturating_sub(expected_gross),
            event.virtual_input_after,
            tolerance,
        )?;
        check_leg(
            "成交后虚拟资产储备",
            vout.saturating_add(event.output_amount),
            event.virtual_output_after,
            tolerance,
        )?;
        next.real_input_balance = current.real_input_balance.saturating_sub(event.input_amount);
        next.total_output_supply = current
            .total_output_supply
            .checked_sub(event.output_amount)
            .ok_or_else(|| {
                format!(
                    "卖出数量 {} 超过本地供应量 {}",
                    event.output_amount, current.total_output_supply
                )
            })?;
    }

    next.virtual_input_reserve = event.virtual_input_after;
    next.virtual_output_reserve = event.virtual_output_after;
    next.last_settled_at = Some(event.settled_at);
    next.trade_count = current.trade_count.saturating_add(1);

    if !current.graduated && next.real_input_balance >= rules.graduation_threshold {
        next.graduated = true;
        log::info!(
            target: LOG_TARGET,
            "资产 {} 真实余额 {} 达到毕业阈值 {}",
            current.address,
            next.real_input_balance,
            rules.graduation_threshold
        );
    }
    Ok(next)
}
