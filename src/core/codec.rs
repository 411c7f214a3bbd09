use std::marker::PhantomData;
use std::sync::Arc;

/// 定宽元素编解码：文件类后端（mmap / 随机访问文件）只通过它读写元素，
/// 从不解释元素内容。
pub trait ItemCodec<T>: Send + Sync {
    /// 每个元素占用的字节数（>= 1）
    fn width(&self) -> usize;
    /// `bytes.len() == width()`
    fn decode(&self, bytes: &[u8]) -> T;
    /// `bytes.len() == width()`
    fn encode(&self, item: &T, bytes: &mut [u8]);
}

pub type SharedCodec<T> = Arc<dyn ItemCodec<T>>;

/// 引擎自带的定宽类型（LE 编码）。
pub trait FixedWidth: Sized + Send + Sync + 'static {
    const WIDTH: usize;
    fn decode_le(bytes: &[u8]) -> Self;
    fn encode_le(&self, bytes: &mut [u8]);
}

macro_rules! fixed_width_num {
    ($($t:ty),*) => {
        $(
            impl FixedWidth for $t {
                const WIDTH: usize = std::mem::size_of::<$t>();

                fn decode_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::WIDTH]);
                    <$t>::from_le_bytes(raw)
                }

                fn encode_le(&self, bytes: &mut [u8]) {
                    bytes[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

fixed_width_num!(i32, u32, i64, u64, f64);

/// `FixedWidth` 类型的编解码器。
pub struct FixedCodec<T>(PhantomData<fn() -> T>);

impl<T: FixedWidth> FixedCodec<T> {
    pub fn shared() -> SharedCodec<T> {
        Arc::new(FixedCodec(PhantomData))
    }
}

impl<T: FixedWidth> ItemCodec<T> for FixedCodec<T> {
    fn width(&self) -> usize {
        T::WIDTH
    }

    fn decode(&self, bytes: &[u8]) -> T {
        T::decode_le(bytes)
    }

    fn encode(&self, item: &T, bytes: &mut [u8]) {
        item.encode_le(bytes)
    }
}

/// 调用方提供的读写函数 + 宽度。
pub struct FnCodec<T> {
    width: usize,
    read: fn(&[u8]) -> T,
    write: fn(&T, &mut [u8]),
}

impl<T: 'static> FnCodec<T> {
    pub fn new(width: usize, read: fn(&[u8]) -> T, write: fn(&T, &mut [u8])) -> Self {
        Self { width, read, write }
    }

    pub fn shared(width: usize, read: fn(&[u8]) -> T, write: fn(&T, &mut [u8])) -> SharedCodec<T> {
        Arc::new(Self::new(width, read, write))
    }
}

impl<T> ItemCodec<T> for FnCodec<T> {
    fn width(&self) -> usize {
        self.width
    }

    fn decode(&self, bytes: &[u8]) -> T {
        (self.read)(bytes)
    }

    fn encode(&self, item: &T, bytes: &mut [u8]) {
        (self.write)(item, bytes)
    }
}
