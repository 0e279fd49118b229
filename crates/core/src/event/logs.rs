use crate::curve::event::{DecodeError, EventSchema, LedgerEvent};

const PROGRAM_DATA_PREFIX: &str = "Program data: ";
const PROGRAM_PREFIX: &str = "Program ";

/// 从交易日志中取出目标程序（调用栈最内层）输出的 `Program data` 负载。
///
/// 通过 `Program <id> invoke [n]` / `success` / `failed` 维护调用栈，其它程序或 CPI
/// 内部输出的数据不会被误收。
pub fn program_data_entries<'a>(logs: &'a [String], program_id: &str) -> Vec<&'a str> {
    let mut stack: Vec<&str> = Vec::new();
    let mut entries = Vec::new();
    for line in logs {
        if let Some(data) = line.strip_prefix(PROGRAM_DATA_PREFIX) {
            if stack.last().copied() == Some(program_id) {
                entries.push(data.trim());
            }
            continue;
        }
        let Some(rest) = line.strip_prefix(PROGRAM_PREFIX) else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let (Some(id), Some(action)) = (parts.next(), parts.next()) else {
            continue;
        };
        match action {
            "invoke" => stack.push(id),
            "success" => {
                stack.pop();
            }
            // `failed:` 带冒号
            other if other.starts_with("failed") => {
                stack.pop();
            }
            _ => {}
        }
    }
    entries
}

/// 单笔交易解码结果，事件序号按 `Program data` 出现顺序编号，包括解码失败的条目。
#[derive(Debug, Default)]
pub struct DecodedLogs {
    pub events: Vec<(u32, LedgerEvent)>,
    pub errors: Vec<(u32, DecodeError)>,
}

pub fn decode_logs(logs: &[String], program_id: &str, schema: &EventSchema) -> DecodedLogs {
    let mut decoded = DecodedLogs::default();
    for (index, data) in program_data_entries(logs, program_id).into_iter().enumerate() {
        let index = index as u32;
        match schema.decode_program_data(data) {
            Ok(event) => decoded.events.push((index, event)),
            Err(err) => decoded.errors.push((index, err)),
        }
    }
    decoded
}

#[cfg(test)]
mod tests {
    use solana_sdk::pubkey::Pubkey;

    use super::*;
    use crate::curve::event::{AssetGraduated, SCHEMA_V1};

    const PROGRAM: &str = "CurveProgram1111111111111111111111111111111";
    const OTHER: &str = "OtherProgram1111111111111111111111111111111";

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|line| line.to_string()).collect()
    }

    #[test]
    fn test_only_program_frames_are_taken() {
        let logs = lines(&[
            &format!("Program {} invoke [1]", PROGRAM),
            "Program log: Instruction: Buy",
            &format!("Program {} invoke [2]", OTHER),
            "Program data: b3RoZXI=",
            &format!("Program {} success", OTHER),
            "Program data: Zmlyc3Q=",
            &format!("Program {} consumed 5000 of 200000 compute units", PROGRAM),
            &format!("Program {} success", PROGRAM),
            "Program data: b3V0c2lkZQ==",
        ]);
        assert_eq!(program_data_entries(&logs, PROGRAM), vec!["Zmlyc3Q="]);
    }

    #[test]
    fn test_failed_frame_pops_stack() {
        let logs = lines(&[
            &format!("Program {} invoke [1]", OTHER),
            &format!("Program {} invoke [2]", PROGRAM),
            &format!("Program {} failed: custom program error: 0x1", PROGRAM),
            "Program data: bGF0ZQ==",
        ]);
        assert!(program_data_entries(&logs, PROGRAM).is_empty());
    }

    #[test]
    fn test_decode_logs_keeps_indices_across_errors() {
        let event = LedgerEvent::AssetGraduated(AssetGraduated {
            address: Pubkey::new_unique(),
            total_input_raised: 85_000_000_000,
            graduated_at: 3,
        });
        let logs = lines(&[
            &format!("Program {} invoke [1]", PROGRAM),
            "Program data: AAEC",
            &format!("Program data: {}", event.to_program_data().expect("编码失败")),
            &format!("Program {} success", PROGRAM),
        ]);
        let decoded = decode_logs(&logs, PROGRAM, &SCHEMA_V1);
        assert_eq!(decoded.errors.len(), 1);
        assert_eq!(decoded.errors[0].0, 0);
        assert!(matches!(decoded.errors[0].1, DecodeError::MalformedEvent(_)));
        assert_eq!(decoded.events, vec![(1, event)]);
    }
}
