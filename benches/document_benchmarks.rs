//! Benchmarks for virtual document rebuilds and coordinate mapping.
//!
//! Run with: cargo bench

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

use nblsp_core::{
    BlockInput, Config, SnapshotEditor, UpdateManager, VirtualDocument, VirtualDocumentOptions,
    VirtualPosition,
};
use nblsp_lsp::convert::lsp_position_in;

/// Notebook cells: mostly code, every tenth one a cell magic.
fn generate_cells(count: usize) -> Vec<BlockInput> {
    (0..count)
        .map(|i| {
            let text = if i % 10 == 9 {
                format!("%%bash\necho cell {}\nls -la\n", i)
            } else {
                format!("import os\nvalue_{} = os.getcwd()\nprint(value_{})\n", i, i)
            };
            BlockInput::from_editor(SnapshotEditor::new(text))
        })
        .collect()
}

fn notebook() -> Arc<VirtualDocument> {
    let extractors = Config::default()
        .extractor_registry()
        .expect("default extractors are valid");
    VirtualDocument::new(
        VirtualDocumentOptions::new("python", "py", "bench.ipynb").with_extractors(Arc::new(extractors)),
    )
}

fn rebuild(document: &VirtualDocument, blocks: &[BlockInput]) {
    document.begin_rebuild();
    for block in blocks {
        document.append_code_block(block);
    }
    document.finish_rebuild();
    document.maybe_emit_changed();
}

/// Benchmarks a full rebuild of notebooks of growing size.
fn bench_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebuild");

    for size in [10, 100, 1000].iter() {
        let cells = generate_cells(*size);

        group.bench_with_input(BenchmarkId::new("cells", size), &cells, |b, cells| {
            b.iter_with_setup(notebook, |document| {
                rebuild(&document, black_box(cells));
                black_box(document)
            })
        });
    }

    group.finish();
}

/// Benchmarks rebuilds through the update manager, lock included.
fn bench_update_manager(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let cells = generate_cells(500);
    let document = notebook();
    let updates = UpdateManager::new(document.clone());

    c.bench_function("update_documents_500_cells", |b| {
        b.iter(|| {
            runtime
                .block_on(updates.update_documents(black_box(cells.clone())))
                .unwrap();
        })
    });
}

/// Benchmarks mapping positions back to editors.
fn bench_mapping(c: &mut Criterion) {
    let mut group = c.benchmark_group("mapping");
    let document = notebook();
    rebuild(&document, &generate_cells(1000));
    let last_line = document.line_count().saturating_sub(2);
    let text = document.value();

    group.bench_function("virtual_to_editor_last_cell", |b| {
        b.iter(|| black_box(document.virtual_to_editor(VirtualPosition::new(last_line, 3))))
    });

    group.bench_function("lsp_position_last_line", |b| {
        b.iter(|| black_box(lsp_position_in(&text, VirtualPosition::new(last_line, 3))))
    });

    group.finish();
}

criterion_group!(benches, bench_rebuild, bench_update_manager, bench_mapping);
criterion_main!(benches);
