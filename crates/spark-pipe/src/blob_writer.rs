//! 变长字段的流式小端写入器。
//!
//! 由 [`PipeWriter::blob_writer`] 打开，直接在字节环工作头之后写入，
//! [`BlobWriter::finish`] 时才做移动平均校验并落成描述符。未调用 `finish` 就丢弃写入器
//! 等价于放弃本次写入：字节环工作头不前移，写入守卫被关闭。

use std::io;

use tracing::warn;

use crate::codec::ByteSink;
use crate::error::Result;
use crate::writer::PipeWriter;

/// 流式字段写入器，与 [`BlobReader`](crate::BlobReader) 的读取顺序一一对应。
pub struct BlobWriter<'a> {
    writer: &'a mut PipeWriter,
    start: i32,
    written: u32,
    room: u32,
    finished: bool,
}

impl<'a> BlobWriter<'a> {
    /// 可写空间比字节环的空闲字节少 1。
    ///
    /// 已发布的字节环尾按环掩码截断，头尾在掩码下相等时“恰好写满”与“为空”无法区分；
    /// 流式写入永远留出最后一个字节，因此不会把环写到这种歧义状态。
    pub(crate) fn new(writer: &'a mut PipeWriter, start: i32) -> Self {
        let used = writer.bytes_of_content().max(0) as usize;
        let room = writer.blob_ring().len().saturating_sub(used + 1) as u32;
        Self {
            writer,
            start,
            written: 0,
            room,
            finished: false,
        }
    }

    /// 已写入的字节数。
    pub fn len(&self) -> usize {
        self.written as usize
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// 字节环中尚可写入的字节数。
    pub fn remaining(&self) -> usize {
        (self.room - self.written) as usize
    }

    fn put(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > self.remaining() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "blob ring has no room for the streamed field",
            ));
        }
        let mut ring = self.writer.blob_ring();
        let base = (self.start as u32).wrapping_add(self.written);
        for (offset, byte) in bytes.iter().enumerate() {
            ring.put_byte(base.wrapping_add(offset as u32), *byte);
        }
        self.written += bytes.len() as u32;
        Ok(())
    }

    pub fn write_bool(&mut self, value: bool) -> io::Result<()> {
        self.put(&[u8::from(value)])
    }

    pub fn write_byte(&mut self, value: i8) -> io::Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_short(&mut self, value: i16) -> io::Result<()> {
        self.put(&value.to_le_bytes())
    }

    /// 16 位 UTF-16 码元。
    pub fn write_char(&mut self, value: u16) -> io::Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_int(&mut self, value: i32) -> io::Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_long(&mut self, value: i64) -> io::Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_float(&mut self, value: f32) -> io::Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_double(&mut self, value: f64) -> io::Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.put(bytes)
    }

    /// 以 16 位码元写入一行文本并追加 `\n`，与 [`BlobReader::read_line`](crate::BlobReader::read_line) 对应。
    pub fn write_line(&mut self, text: &str) -> io::Result<()> {
        for unit in text.encode_utf16() {
            self.write_char(unit)?;
        }
        self.write_char(u16::from(b'\n'))
    }

    /// 2 字节小端长度前缀 + UTF-8 内容。
    pub fn write_utf(&mut self, text: &str) -> io::Result<()> {
        let length = u16::try_from(text.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "length-prefixed text exceeds 65535 bytes")
        })?;
        if text.len() + 2 > self.remaining() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "blob ring has no room for the streamed field",
            ));
        }
        self.put(&length.to_le_bytes())?;
        self.put(text.as_bytes())
    }

    /// 校验并提交字段，返回字段长度。校验失败时管道已关停，写入守卫同样被关闭。
    pub fn finish(mut self) -> Result<i32> {
        self.finished = true;
        let length = self.written as i32;
        let validated = self.writer.validate_var_length(length);
        self.writer.close_blob_field_write()?;
        validated?;
        self.writer.commit_blob_field(self.start, length);
        Ok(length)
    }
}

impl io::Write for BlobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = buf.len().min(self.remaining());
        if count == 0 && !buf.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        self.put(&buf[..count])?;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BlobWriter<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(error) = self.writer.close_blob_field_write() {
                warn!(
                    pipe = self.writer.id(),
                    code = error.code(),
                    %error,
                    "abandoned blob writer failed to close its write guard"
                );
            }
        }
    }
}

impl core::fmt::Debug for BlobWriter<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlobWriter")
            .field("start", &self.start)
            .field("written", &self.written)
            .field("room", &self.room)
            .finish()
    }
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use std::io::Write;

    use crate::config::PipeConfig;
    use crate::error::PipeError;
    use crate::pipe::PipeRegistry;
    use crate::reader::PipeReader;
    use crate::schema::{FieldKind, MessageSchema};
    use crate::writer::PipeWriter;

    const BLOB: i32 = 0;

    fn split(slab_bits: u8, blob_bits: u8) -> (PipeWriter, PipeReader) {
        let schema = MessageSchema::builder("Stream")
            .message("Blob", [FieldKind::Bytes])
            .build()
            .expect("模式");
        let config = PipeConfig::new(alloc::sync::Arc::new(schema), slab_bits, blob_bits).expect("配置");
        let mut pipe = PipeRegistry::new().create(config).expect("创建");
        pipe.init_buffers().expect("分配");
        pipe.split().expect("拆分")
    }

    #[test]
    fn stream_never_fills_the_last_blob_byte() {
        let (mut writer, _reader) = split(5, 4);
        writer.block_write_message(BLOB).expect("开始消息");
        let mut blob = writer.blob_writer().expect("打开");
        assert_eq!(blob.remaining(), 15, "16 字节的环只开放 15 字节");
        blob.write_bytes(&[9u8; 15]).expect("填到上限");
        let error = blob.write_byte(1).expect_err("最后一个字节保留");
        assert_eq!(error.kind(), std::io::ErrorKind::WriteZero);
        assert_eq!(blob.write(&[1, 2]).expect_err("io::Write 同样拒绝").kind(), std::io::ErrorKind::WriteZero);
    }

    #[test]
    fn released_bytes_return_to_the_stream_room() {
        let (mut writer, mut reader) = split(5, 4);
        let size = writer.block_write_message(BLOB).expect("开始消息");
        writer.add_byte_array(b"abc").expect("写入");
        writer.confirm_low_level_write(size);
        writer.publish_writes();
        assert_eq!(reader.take_msg_idx(), BLOB);
        reader.take_ring_byte_meta_data();
        reader.take_ring_byte_len();
        reader.confirm_low_level_read(size);
        reader.release_read_lock();

        writer.block_write_message(BLOB).expect("开始消息");
        let blob = writer.blob_writer().expect("打开");
        assert_eq!(blob.remaining(), 15, "已释放的字节重新可用");
    }

    #[test]
    #[tracing_test::traced_test]
    fn dropped_writer_reports_a_failed_guard_close() {
        let (mut writer, _reader) = split(5, 8);
        writer.block_write_message(BLOB).expect("开始消息");
        let mut blob = writer.blob_writer().expect("打开");
        // 守卫在写入器之外被关闭后，丢弃写入器时的关闭会失败并留下告警。
        blob.writer.close_blob_field_write().expect("外部关闭");
        drop(blob);
        assert!(logs_contain("abandoned blob writer failed to close its write guard"));
        assert!(logs_contain("pipe.blob_write_not_open"));
        assert!(writer.is_shutdown(), "重复关闭守卫仍会关停管道");
        assert_eq!(writer.close_blob_field_write(), Err(PipeError::BlobWriteNotOpen));
    }
}
