use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mima_emulator::{MainMemory, MicroAssembler, MinimalMachine};

const DECODER: &str = include_str!("../microcode/decoder.mprog");

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("compile canonical decoder", |b| {
        b.iter(|| MicroAssembler::compile(black_box(DECODER)).unwrap())
    });

    let decoder = MicroAssembler::compile(DECODER).unwrap();

    // LDC; a chain of ADDs; STV; HALT
    let image: Vec<(u32, u32)> = vec![
        (0, 0x0000FF),
        (1, 0x300020),
        (2, 0x300020),
        (3, 0x300020),
        (4, 0x300020),
        (5, 0x200030),
        (6, 0xF00000),
        (0x20, 0x000003),
    ];

    c.bench_function("lifetime run", |b| {
        b.iter(|| {
            let memory: MainMemory = image.iter().copied().collect();
            let mut mima = MinimalMachine::new(decoder.clone(), memory);
            mima.run(None);
            black_box(mima.acc())
        })
    });

    let memory: MainMemory = image.iter().copied().collect();
    let mut mima = MinimalMachine::new(decoder.clone(), memory);
    c.bench_function("single clock cycle", |b| {
        b.iter(|| {
            mima.micro_step();
            black_box(mima.microstate())
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
