use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;

use seqbank::bitstream::{IbitStream, ObitStream};
use seqbank::compression::{fastlz, read_array, write_array};
use seqbank::index::{BTree, KeyOrder};
use seqbank::storage::Pager;

fn posting_codec(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let mut docs: Vec<u32> = Vec::with_capacity(10_000);
    let mut cur = 0u32;
    for _ in 0..10_000 {
        cur += rng.gen_range(1..50);
        docs.push(cur);
    }

    c.bench_function("compress 10k postings", |b| {
        b.iter(|| {
            let mut bits = ObitStream::new();
            write_array(&mut bits, black_box(&docs)).unwrap();
            bits.sync().unwrap();
            bits.byte_size()
        })
    });

    let mut bits = ObitStream::new();
    write_array(&mut bits, &docs).unwrap();
    bits.sync().unwrap();

    c.bench_function("decompress 10k postings", |b| {
        b.iter(|| {
            let mut ib = IbitStream::from_obit(black_box(&bits)).unwrap();
            read_array(&mut ib).unwrap().len()
        })
    });
}

fn tree_operations(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let pager = Arc::new(Pager::create(&dir.path().join("bench.ix"), 8192).unwrap());
    let tree: BTree<u32> = BTree::new(pager, KeyOrder::Lexical);
    tree.set_auto_commit(false);
    for i in 0..50_000u32 {
        tree.insert(format!("key{i:08}").as_bytes(), &i).unwrap();
    }

    c.bench_function("tree find", |b| {
        let mut i = 0u32;
        b.iter(|| {
            i = (i + 7919) % 50_000;
            tree.find(format!("key{i:08}").as_bytes()).unwrap()
        })
    });
}

fn document_compression(c: &mut Criterion) {
    let record = "ID   CRAM_CRAAB   Reviewed;   46 AA.\nDE   RecName: Full=Crambin;\n\
                  OS   Crambe hispanica subsp. abyssinica.\nSQ   SEQUENCE 46 AA;\n"
        .repeat(16);

    c.bench_function("fastlz compress 4k record", |b| {
        b.iter(|| fastlz::compress(black_box(record.as_bytes())).map(|v| v.len()))
    });
}

criterion_group!(benches, posting_codec, tree_operations, document_compression);
criterion_main!(benches);
