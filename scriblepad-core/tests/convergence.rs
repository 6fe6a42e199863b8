//! Multi-replica convergence: random interleavings of local edits and
//! delayed delivery must end with every buffer equal to its container and
//! every replica equal to the others.

use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

use scriblepad_core::{
    ChangeOrigin, DocumentEvent, EditorOptions, EditorReconciler, SharedDocument, Subscription,
    TextField,
};

/// One replica: document, body editor, and the local updates not yet
/// delivered to the peer.
struct Replica {
    doc: Arc<SharedDocument>,
    editor: EditorReconciler,
    outbox: Arc<Mutex<Vec<Arc<Vec<u8>>>>>,
    _outbox_sub: Subscription,
}

impl Replica {
    fn new() -> Self {
        let doc = Arc::new(SharedDocument::new());
        let editor = EditorReconciler::new(doc.clone(), TextField::Body, EditorOptions::body());
        let outbox = Arc::new(Mutex::new(Vec::new()));
        let sink = outbox.clone();
        let sub = doc.subscribe(move |event| {
            if let DocumentEvent::Updated { update, origin } = event {
                if origin.is_local() {
                    sink.lock().push(update.clone());
                }
            }
        });
        Self {
            doc,
            editor,
            outbox,
            _outbox_sub: sub,
        }
    }

    /// Splice the buffer the way a user would: replace `delete` chars at
    /// `pos` with `insert`.
    fn type_at(&self, pos: usize, delete: usize, insert: &str) {
        let chars: Vec<char> = self.editor.text().chars().collect();
        let pos = pos % (chars.len() + 1);
        let delete = delete.min(chars.len() - pos);
        let mut next: String = chars[..pos].iter().collect();
        next.push_str(insert);
        next.extend(&chars[pos + delete..]);
        self.editor.local_edit(&next, None).unwrap();
    }

    fn deliver_to(&self, other: &Replica) {
        let pending: Vec<_> = self.outbox.lock().drain(..).collect();
        for update in pending {
            other.doc.apply_update(&update, ChangeOrigin::Remote).unwrap();
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Edit {
        replica: usize,
        pos: usize,
        delete: usize,
        insert: String,
    },
    Deliver {
        from: usize,
    },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..2usize, any::<usize>(), 0..4usize, "[a-cé \n]{0,4}").prop_map(
            |(replica, pos, delete, insert)| Op::Edit {
                replica,
                pos,
                delete,
                insert,
            }
        ),
        1 => (0..2usize).prop_map(|from| Op::Deliver { from }),
    ]
}

fn assert_settled(replicas: &[Replica]) {
    for r in replicas {
        assert_eq!(r.editor.text(), r.doc.text(TextField::Body));
    }
    let first = replicas[0].doc.text(TextField::Body);
    for r in &replicas[1..] {
        assert_eq!(r.doc.text(TextField::Body), first);
    }
}

proptest! {
    #[test]
    fn test_buffers_converge_after_delivery(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let replicas = [Replica::new(), Replica::new()];

        for op in &ops {
            match op {
                Op::Edit { replica, pos, delete, insert } => {
                    let r = &replicas[*replica];
                    r.type_at(*pos, *delete, insert);
                    // Settle point for the editing replica.
                    prop_assert_eq!(r.editor.text(), r.doc.text(TextField::Body));
                }
                Op::Deliver { from } => {
                    replicas[*from].deliver_to(&replicas[1 - *from]);
                }
            }
        }

        replicas[0].deliver_to(&replicas[1]);
        replicas[1].deliver_to(&replicas[0]);
        assert_settled(&replicas);
    }
}

#[test]
fn test_concurrent_edits_both_survive() {
    let replicas = [Replica::new(), Replica::new()];
    replicas[0].editor.local_edit("base", None).unwrap();
    replicas[0].deliver_to(&replicas[1]);

    replicas[0].type_at(0, 0, "A ");
    replicas[1].type_at(4, 0, " B");
    replicas[0].deliver_to(&replicas[1]);
    replicas[1].deliver_to(&replicas[0]);

    assert_settled(&replicas);
    assert_eq!(replicas[0].doc.text(TextField::Body), "A base B");
}

#[test]
fn test_three_replicas_full_mesh() {
    let replicas = [Replica::new(), Replica::new(), Replica::new()];
    replicas[0].editor.local_edit("one ", None).unwrap();
    replicas[1].editor.local_edit("two ", None).unwrap();
    replicas[2].editor.local_edit("three", None).unwrap();

    // Snapshot-based sync: every replica pulls what it is missing.
    for i in 0..3 {
        for j in 0..3 {
            if i != j {
                let diff = replicas[i]
                    .doc
                    .encode_diff(&replicas[j].doc.state_vector())
                    .unwrap();
                replicas[j].doc.apply_update(&diff, ChangeOrigin::Remote).unwrap();
            }
        }
    }

    assert_settled(&replicas);
    let text = replicas[0].doc.text(TextField::Body);
    for word in ["one", "two", "three"] {
        assert!(text.contains(word), "{word} missing from {text:?}");
    }
}
