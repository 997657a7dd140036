use blockmesh::{ArrayRef, DocOptions, DocType, ItemContent, TextRef, WorkspaceCell, WorkspaceOptions};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lib0::any::Any;

fn text_insert(c: &mut Criterion) {
    c.bench_function("text_insert_1000_chars", |b| {
        b.iter(|| {
            let doc = blockmesh::Doc::detached(DocType::Text, &DocOptions::new());
            doc.transact(None, |txn| {
                let branch = txn.doc.clone().borrow_mut().root();
                for _ in 0..1000 {
                    txn.push_str(branch, "a").unwrap();
                }
            });
            let text = TextRef::from(doc.borrow_mut().root());
            black_box(text.len());
        })
    });
}

fn array_push(c: &mut Criterion) {
    c.bench_function("array_push_1000_items", |b| {
        b.iter(|| {
            let doc = blockmesh::Doc::detached(DocType::Array, &DocOptions::new());
            doc.transact(None, |txn| {
                let branch = txn.doc.clone().borrow_mut().root();
                for i in 0..1000 {
                    txn.push(branch, ItemContent::Embed(Any::Number(i as f64))).unwrap();
                }
            });
            let arr = ArrayRef::from(doc.borrow_mut().root());
            black_box(arr.len());
        })
    });
}

fn workspace_set_ref(c: &mut Criterion) {
    c.bench_function("workspace_set_ref_churn", |b| {
        b.iter(|| {
            let ws = WorkspaceCell::new(WorkspaceOptions::new());
            let root = ws.get_or_create_root_doc("bench-root", DocType::Map).unwrap();
            let root_id = root.borrow().id.clone();
            for i in 0..100 {
                let child = ws.create_doc(DocType::Array);
                let child_id = child.borrow().id.clone();
                let key = format!("k{}", i);
                ws.transact(None, |wtx| {
                    let txn = wtx.doc(&root_id).unwrap();
                    let branch = txn.doc.clone().borrow_mut().root();
                    txn.set_ref(branch, &key, child_id.clone(), DocType::Array).unwrap();
                });
            }
            black_box(&root_id);
        })
    });
}

criterion_group!(benches, text_insert, array_push, workspace_set_ref);
criterion_main!(benches);
