use crate::core::FixedWidth;

/// 哈希链节点：按位置存在与元素平行的数组里，`next_node == -1` 表示链尾。
///
/// 磁盘布局（两种文件后端相同）：`next_node i64 | item_index i64 | hash_code i32`，共 20 字节 LE。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    pub hash_code: i32,
    pub item_index: u64,
    pub next_node: i64,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            hash_code: 0,
            item_index: 0,
            next_node: -1,
        }
    }
}

impl FixedWidth for Node {
    const WIDTH: usize = 20;

    fn decode_le(bytes: &[u8]) -> Self {
        Self {
            next_node: i64::decode_le(&bytes[0..8]),
            item_index: i64::decode_le(&bytes[8..16]) as u64,
            hash_code: i32::decode_le(&bytes[16..20]),
        }
    }

    fn encode_le(&self, bytes: &mut [u8]) {
        self.next_node.encode_le(&mut bytes[0..8]);
        (self.item_index as i64).encode_le(&mut bytes[8..16]);
        self.hash_code.encode_le(&mut bytes[16..20]);
    }
}
