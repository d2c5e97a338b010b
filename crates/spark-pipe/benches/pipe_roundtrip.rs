use criterion::{Criterion, black_box};
use spark_pipe::{FieldKind, MessageSchema, PipeConfig, PipeReader, PipeRegistry, PipeWriter};
use std::{env, sync::Arc, time::Duration};

const TICK: i32 = 0;
const NOTE: i32 = 1;

/// 管道单线程往返基准：写入、发布、读取、释放一条消息的完整成本。
///
/// # 设计背景（Why）
/// - 调整发布/释放批量或位置缓存时，需要量化单条消息在热路径上的固定开销；
/// - 单线程往返排除了跨核缓存行争用，便于定位算法层面的回归。
///
/// # 逻辑解析（How）
/// - `tick` 仅包含定长字段，衡量槽环读写与发布计数器的开销；
/// - `note` 额外写入一个 UTF-8 变长字段，覆盖字节环复制、尾随计数与解码路径；
/// - 批量版本将发布与释放合并为每 8 条一次，体现批量化节省的原子写成本。
fn bench_pipe_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipe_roundtrip");

    let (mut writer, mut reader) = endpoints(1);
    group.bench_function("tick", |b| {
        b.iter(|| {
            write_tick(&mut writer, black_box(7), black_box(1_700_000_000_000));
            black_box(read_tick(&mut reader))
        });
    });

    let (mut writer, mut reader) = endpoints(1);
    let mut text = String::with_capacity(64);
    group.bench_function("note_utf8", |b| {
        b.iter(|| {
            write_note(&mut writer, black_box("行情快照 #42 已送达"));
            black_box(read_note(&mut reader, &mut text))
        });
    });

    let (mut writer, mut reader) = endpoints(8);
    group.bench_function("tick_batched_8", |b| {
        b.iter(|| {
            for seq in 0..8 {
                write_tick(&mut writer, seq, black_box(seq as i64));
            }
            for _ in 0..8 {
                black_box(read_tick(&mut reader));
            }
        });
    });

    group.finish();
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_pipe_roundtrip(&mut criterion);
    criterion.final_summary();
}

fn endpoints(batch: u32) -> (PipeWriter, PipeReader) {
    let schema = Arc::new(
        MessageSchema::builder("Bench")
            .message("Tick", [FieldKind::Int, FieldKind::Long])
            .message("Note", [FieldKind::Utf8])
            .build()
            .unwrap(),
    );
    let config = PipeConfig::new(schema, 10, 16)
        .unwrap()
        .with_publish_batch_size(batch)
        .with_release_batch_size(batch);
    let mut pipe = PipeRegistry::new().create(config).unwrap();
    pipe.init_buffers().unwrap();
    pipe.split().unwrap()
}

fn write_tick(writer: &mut PipeWriter, id: i32, stamp: i64) {
    let size = writer.block_write_message(TICK).unwrap();
    writer.add_int_value(id);
    writer.add_long_value(stamp);
    writer.confirm_low_level_write(size);
    writer.publish_writes();
}

fn read_tick(reader: &mut PipeReader) -> i64 {
    assert!(reader.has_content_to_read());
    let msg_idx = reader.take_msg_idx();
    let id = reader.take_int();
    let stamp = reader.take_long();
    reader.confirm_low_level_read(reader.size_of(msg_idx).unwrap());
    reader.release_read_lock();
    stamp + id as i64
}

fn write_note(writer: &mut PipeWriter, text: &str) {
    let size = writer.block_write_message(NOTE).unwrap();
    writer.add_utf8(Some(text)).unwrap();
    writer.confirm_low_level_write(size);
    writer.publish_writes();
}

fn read_note(reader: &mut PipeReader, text: &mut String) -> usize {
    assert!(reader.has_content_to_read());
    let msg_idx = reader.take_msg_idx();
    let meta = reader.take_ring_byte_meta_data();
    let len = reader.take_ring_byte_len();
    text.clear();
    let chars = reader.read_utf8(meta, len, text);
    reader.confirm_low_level_read(reader.size_of(msg_idx).unwrap());
    reader.release_read_lock();
    chars
}
