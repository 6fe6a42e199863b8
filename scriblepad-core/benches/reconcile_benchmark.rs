use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;

use scriblepad_core::diff::{minimal_edit, DiffStrategy, TextEdit};
use scriblepad_core::versions::has_significant_change;
use scriblepad_core::{EditorOptions, EditorReconciler, SharedDocument, TextField, Version};

fn long_text(paragraphs: usize) -> String {
    "The quick brown fox jumps over the lazy dog. ".repeat(paragraphs * 8)
}

fn bench_minimal_edit_10k(c: &mut Criterion) {
    let old = long_text(30);
    let mut new = old.clone();
    new.insert_str(old.len() / 2, "inserted words ");

    c.bench_function("minimal_edit_10k_mid_insert", |b| {
        b.iter(|| black_box(minimal_edit(black_box(&old), black_box(&new))))
    });
}

fn bench_replace_all_10k(c: &mut Criterion) {
    let old = long_text(30);
    let new = format!("{old}!");

    c.bench_function("replace_all_10k", |b| {
        b.iter(|| {
            black_box(TextEdit::between(
                black_box(&old),
                black_box(&new),
                DiffStrategy::ReplaceAll,
            ))
        })
    });
}

fn bench_local_edit_keystroke(c: &mut Criterion) {
    let doc = Arc::new(SharedDocument::new());
    let editor = EditorReconciler::new(doc, TextField::Body, EditorOptions::body());
    editor.local_edit(&long_text(10), None).unwrap();

    c.bench_function("local_edit_append_keystroke", |b| {
        b.iter(|| {
            let mut value = editor.text();
            value.push('x');
            black_box(editor.local_edit(&value, None).unwrap());
        })
    });
}

fn bench_significant_change(c: &mut Criterion) {
    let body = long_text(20);
    let last = Version {
        id: "v".into(),
        timestamp: 0,
        title_snapshot: "Title".into(),
        body_snapshot: body.clone(),
    };
    let edited = format!("{body}a few more chars");

    c.bench_function("significant_change_check", |b| {
        b.iter(|| black_box(has_significant_change("Title", black_box(&edited), Some(&last))))
    });
}

criterion_group!(
    benches,
    bench_minimal_edit_10k,
    bench_replace_all_10k,
    bench_local_edit_keystroke,
    bench_significant_change,
);
criterion_main!(benches);
