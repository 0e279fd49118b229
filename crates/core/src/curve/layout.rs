use solana_sdk::pubkey::Pubkey;

use super::event::DecodeError;

const PUBKEY_LEN: usize = 32;

/// 链上事件的定长字节布局读取器（小端整数、u32 长度前缀字符串）。
pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], DecodeError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or_else(|| DecodeError::MalformedEvent(format!("{} 长度溢出", field)))?;
        if end > self.data.len() {
            return Err(DecodeError::MalformedEvent(format!(
                "{} 截断: 需要 {} 字节, 剩余 {}",
                field,
                len,
                self.data.len() - self.offset
            )));
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self, field: &str) -> Result<[u8; N], DecodeError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N, field)?);
        Ok(buf)
    }

    pub fn read_u64(&mut self, field: &str) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take_array::<8>(field)?))
    }

    pub fn read_i64(&mut self, field: &str) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.take_array::<8>(field)?))
    }

    pub fn read_bool(&mut self, field: &str) -> Result<bool, DecodeError> {
        match self.take_array::<1>(field)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::MalformedEvent(format!(
                "{} 布尔值非法: {}",
                field, other
            ))),
        }
    }

    pub fn read_pubkey(&mut self, field: &str) -> Result<Pubkey, DecodeError> {
        Ok(Pubkey::new_from_array(self.take_array::<PUBKEY_LEN>(field)?))
    }

    pub fn read_string(&mut self, field: &str) -> Result<String, DecodeError> {
        let len = u32::from_le_bytes(self.take_array::<4>(field)?) as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| DecodeError::MalformedEvent(format!("{} 非 UTF-8: {}", field, err)))
    }

    /// 要求负载恰好读完，多余字节视为格式错误。
    pub fn finish(self) -> Result<(), DecodeError> {
        let remaining = self.data.len() - self.offset;
        if remaining != 0 {
            return Err(DecodeError::MalformedEvent(format!("存在 {} 字节多余数据", remaining)));
        }
        Ok(())
    }
}

/// 与 [`ByteReader`] 对称的写入器，用于构造测试与回放负载。
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn u64(self, value: u64) -> Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn i64(self, value: i64) -> Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn bool(self, value: bool) -> Self {
        self.bytes(&[value as u8])
    }

    pub fn pubkey(self, key: &Pubkey) -> Self {
        self.bytes(key.as_ref())
    }

    pub fn string(self, value: &str) -> Self {
        let len = value.len() as u32;
        self.bytes(&len.to_le_bytes()).bytes(value.as_bytes())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
