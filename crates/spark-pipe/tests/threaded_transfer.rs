//! `threaded_transfer` 集成测试：真实线程下的单写单读传输。
//!
//! # 测试目标（Why）
//! - 小容量环迫使两端频繁自旋等待，覆盖回绕、批量发布/释放与 EOF 收尾的并发路径；
//! - 读端逐条校验内容与顺序，任何可见性错误都会表现为内容错乱。

#![cfg(not(any(loom, spark_loom)))]

use std::sync::Arc;
use std::thread;

use spark_pipe::{FieldKind, MessageSchema, PipeConfig, PipeRegistry};
use tracing_subscriber::EnvFilter;

const RECORD: i32 = 0;
const MESSAGES: i64 = 20_000;

fn payload(seq: i64) -> String {
    let width = (seq % 23) as usize + 1;
    format!("{seq:0width$}-é")
}

/// 通过 `RUST_LOG=spark_pipe=debug` 观察批量调整与 EOF 日志；重复初始化时静默忽略。
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn producer_and_consumer_agree_on_every_record() {
    init_tracing();
    let schema = Arc::new(
        MessageSchema::builder("Transfer")
            .message("Record", [FieldKind::Long, FieldKind::Utf8])
            .build()
            .expect("模式"),
    );
    let config = PipeConfig::new(schema, 7, 10)
        .expect("配置")
        .with_publish_batch_size(4)
        .with_release_batch_size(4);
    let mut pipe = PipeRegistry::new().create(config).expect("创建");
    pipe.init_buffers().expect("分配");
    let (mut writer, mut reader) = pipe.split().expect("拆分");

    let producer = thread::spawn(move || {
        for seq in 0..MESSAGES {
            let size = writer.block_write_message(RECORD).expect("等待空间");
            writer.add_long_value(seq);
            writer.add_utf8(Some(&payload(seq))).expect("写入文本");
            writer.confirm_low_level_write(size);
            writer.publish_writes();
        }
        writer.publish_all_batched_writes();
        writer.spin_block_for_room(spark_pipe::EOF_SIZE).expect("等待 EOF 空间");
        writer.publish_eof().expect("发布 EOF");
    });

    let consumer = thread::spawn(move || {
        let mut expected = 0i64;
        let mut text = String::new();
        loop {
            reader.spin_block_for_content().expect("等待内容");
            let msg_idx = reader.take_msg_idx();
            if msg_idx == -1 {
                reader.confirm_low_level_read(spark_pipe::EOF_SIZE);
                reader.release_read_lock();
                reader.release_all_batched_reads();
                break;
            }
            assert_eq!(msg_idx, RECORD);
            assert_eq!(reader.take_long(), expected, "顺序必须保持");
            let meta = reader.take_ring_byte_meta_data();
            let len = reader.take_ring_byte_len();
            text.clear();
            reader.read_utf8(meta, len, &mut text);
            assert_eq!(text, payload(expected));
            reader.confirm_low_level_read(reader.size_of(RECORD).expect("尺寸"));
            reader.release_read_lock();
            expected += 1;
        }
        expected
    });

    producer.join().expect("生产者不应 panic");
    let received = consumer.join().expect("消费者不应 panic");
    assert_eq!(received, MESSAGES);
    assert_eq!(pipe.content_remaining().expect("已初始化"), 0);
    assert!(pipe.is_end_of_pipe(pipe.tail_position().expect("已初始化")).expect("已初始化"));
}
