//! `release_ordering` 集成测试：批量释放与延迟释放交织时，已发布的尾位置只进不退。
//!
//! # 测试目标（Why）
//! - 写端依据已发布的槽环尾与字节环尾计算可复用空间，任何一次回退都会让写端覆盖读端仍在读取的数据；
//! - 覆盖三条会发布尾位置的路径：批量刷新、按字节数的部分释放、以及把工作尾直接发布的主动让出。

#![cfg(not(any(loom, spark_loom)))]

use std::sync::Arc;

use spark_pipe::{FieldKind, MessageSchema, Pipe, PipeConfig, PipeReader, PipeRegistry, PipeWriter};

const BYTES: i32 = 0;
const FRAGMENT: usize = 4;

fn pipe() -> Pipe {
    let schema = Arc::new(
        MessageSchema::builder("Release")
            .message("Bytes", [FieldKind::Bytes])
            .build()
            .expect("模式"),
    );
    let config = PipeConfig::new(schema, 6, 10).expect("配置");
    let mut pipe = PipeRegistry::new().create(config).expect("创建");
    pipe.init_buffers().expect("分配");
    pipe
}

fn write_bytes(writer: &mut PipeWriter, data: &[u8]) {
    let size = writer.block_write_message(BYTES).expect("开始消息");
    writer.add_byte_array(data).expect("写入");
    writer.confirm_low_level_write(size);
    writer.publish_writes();
}

fn read_bytes(reader: &mut PipeReader) -> Vec<u8> {
    assert!(reader.has_content_to_read(), "应有可读内容");
    assert_eq!(reader.take_msg_idx(), BYTES);
    let meta = reader.take_ring_byte_meta_data();
    let len = reader.take_ring_byte_len();
    let data = reader.read_optional_bytes(meta, len).expect("非空字段");
    reader.confirm_low_level_read(FRAGMENT);
    data
}

/// 记录每次观察到的 `(槽环尾, 字节环尾)`，并断言二者都没有回退。
struct TailWatch {
    last: (i64, i32),
}

impl TailWatch {
    fn new(pipe: &Pipe) -> Self {
        Self {
            last: Self::tails(pipe),
        }
    }

    fn tails(pipe: &Pipe) -> (i64, i32) {
        (
            pipe.tail_position().expect("已初始化"),
            pipe.blob_tail_position().expect("已初始化"),
        )
    }

    fn observe(&mut self, pipe: &Pipe, step: &str) -> (i64, i32) {
        let now = Self::tails(pipe);
        assert!(now.0 >= self.last.0, "{step}: 槽环尾从 {} 回退到 {}", self.last.0, now.0);
        assert!(now.1 >= self.last.1, "{step}: 字节环尾从 {} 回退到 {}", self.last.1, now.1);
        self.last = now;
        now
    }
}

#[test]
fn partial_pending_release_survives_batch_flush() {
    let mut pipe = pipe();
    let (mut writer, mut reader) = pipe.split().expect("拆分");
    reader.set_release_batch_size(4).expect("批量在上限内");
    let mut watch = TailWatch::new(&pipe);

    write_bytes(&mut writer, &[1u8; 10]);
    write_bytes(&mut writer, &[2u8; 6]);
    assert_eq!(read_bytes(&mut reader), [1u8; 10]);
    assert_eq!(reader.read_next_without_releasing_read_lock(), 10);
    assert_eq!(read_bytes(&mut reader), [2u8; 6]);
    assert_eq!(reader.read_next_without_releasing_read_lock(), 6);
    assert_eq!(reader.pending_release_count(), 2);

    // 第一个片段整体释放但被批量暂存；第二个片段只消费了 3 个字节。
    reader.release_pending_as_read_lock(13);
    assert_eq!(watch.observe(&pipe, "部分释放"), (0, 13), "槽环尾仍在批量中，字节环尾推进到已消费处");
    assert_eq!(reader.pending_release_count(), 1);

    reader.release_all_batched_reads();
    assert_eq!(watch.observe(&pipe, "批量刷新"), (4, 13), "刷新只发布第一个片段的槽位，字节环尾保持不退");

    reader.release_pending_as_read_lock(3);
    assert_eq!(reader.pending_release_count(), 0);
    reader.release_all_batched_reads();
    assert_eq!(watch.observe(&pipe, "释放剩余字节"), (8, 16));
    assert_eq!(pipe.content_remaining().expect("已初始化"), 0);
}

#[test]
fn pending_releases_follow_the_batch_countdown() {
    let mut pipe = pipe();
    let (mut writer, mut reader) = pipe.split().expect("拆分");
    reader.set_release_batch_size(2).expect("批量在上限内");
    let mut watch = TailWatch::new(&pipe);

    for payload in [b"one".as_slice(), b"three", b"fifteen"] {
        write_bytes(&mut writer, payload);
        read_bytes(&mut reader);
        reader.read_next_without_releasing_read_lock();
    }

    assert!(reader.release_pending_read_lock());
    assert_eq!(watch.observe(&pipe, "第一次释放"), (0, 0), "批量未满时不发布");
    assert!(reader.release_pending_read_lock());
    assert_eq!(watch.observe(&pipe, "第二次释放"), (8, 8));
    reader.release_all_pending_read_lock();
    assert_eq!(watch.observe(&pipe, "释放全部"), (8, 8), "第三次释放仍在批量中");
    reader.release_all_batched_reads();
    assert_eq!(watch.observe(&pipe, "批量刷新"), (12, 15));
    assert!(!reader.release_pending_read_lock(), "队列已空");
}

#[test]
fn release_up_to_this_position_publishes_working_tails() {
    let mut pipe = pipe();
    let (mut writer, mut reader) = pipe.split().expect("拆分");
    reader.set_release_batch_size(4).expect("批量在上限内");
    let mut watch = TailWatch::new(&pipe);

    for payload in [b"abc".as_slice(), b"defg", b"hi"] {
        write_bytes(&mut writer, payload);
    }
    for _ in 0..2 {
        read_bytes(&mut reader);
        reader.release_read_lock();
    }
    assert_eq!(watch.observe(&pipe, "批量暂存"), (0, 0));

    reader.release_batched_reads_up_to_this_position();
    assert_eq!(watch.observe(&pipe, "主动让出"), (8, 7), "直接发布工作尾");
    assert_eq!(reader.tail_position(), 8);

    assert_eq!(read_bytes(&mut reader), b"hi");
    reader.release_read_lock();
    assert_eq!(watch.observe(&pipe, "新一轮批量"), (8, 7), "让出后批量倒计数重新开始");
    reader.release_all_batched_reads();
    assert_eq!(watch.observe(&pipe, "批量刷新"), (12, 9));
    assert_eq!(pipe.content_remaining().expect("已初始化"), 0);
}
