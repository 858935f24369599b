//! Property tests for the transformation engine.
//!
//! Pairwise: two concurrent edits converge in either commit order.
//! End to end: several `ClientDocument`s talking to a sequencing server over
//! FIFO channels, with arbitrary interleavings, end on identical text.

use std::collections::VecDeque;

use proptest::prelude::*;
use scrivener_core::ot::{
    ClientDocument, Edit, Tie, apply_to_str, transform, transform_against_history,
    transform_position,
};
use scrivener_core::types::{Ack, Operation, VersionId};

// =============================================================================
// Strategies
// =============================================================================

#[derive(Clone, Debug)]
enum EditSeed {
    Insert { pos_pct: f64, text: String },
    Delete { pos_pct: f64, len_pct: f64 },
}

fn edit_seed() -> impl Strategy<Value = EditSeed> {
    prop_oneof![
        (0.0..=1.0f64, "[a-zé✓]{1,4}").prop_map(|(pos_pct, text)| EditSeed::Insert { pos_pct, text }),
        (0.0..=1.0f64, 0.0..=1.0f64)
            .prop_map(|(pos_pct, len_pct)| EditSeed::Delete { pos_pct, len_pct }),
    ]
}

/// Turn a seed into an edit valid against a document of `len` chars.
fn realize(seed: &EditSeed, len: usize) -> Edit {
    match seed {
        EditSeed::Insert { pos_pct, text } => {
            Edit::insert(((pos_pct * len as f64) as usize).min(len), text.clone())
        }
        EditSeed::Delete { pos_pct, len_pct } => {
            if len == 0 {
                return Edit::delete(0, 0);
            }
            let start = ((pos_pct * len as f64) as usize).min(len - 1);
            let max = len - start;
            let n = ((len_pct * max as f64) as usize).clamp(1, max);
            Edit::delete(start, n)
        }
    }
}

fn base_text() -> impl Strategy<Value = String> {
    "[a-z0-9é]{0,16}"
}

// =============================================================================
// Pairwise convergence
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn concurrent_pair_converges(base in base_text(), a in edit_seed(), b in edit_seed()) {
        let len = base.chars().count();
        let a = realize(&a, len);
        let b = realize(&b, len);

        // b committed first
        let via_b = apply_to_str(
            &apply_to_str(&base, [&b]).unwrap(),
            &transform(&a, &b, Tie::AgainstFirst),
        ).unwrap();
        let via_a = apply_to_str(
            &apply_to_str(&base, [&a]).unwrap(),
            &transform(&b, &a, Tie::OpFirst),
        ).unwrap();
        prop_assert_eq!(via_b, via_a);
    }

    #[test]
    fn inserted_text_survives_concurrent_delete(
        base in "[a-z]{1,16}",
        pos_pct in 0.0..=1.0f64,
        del in edit_seed(),
    ) {
        let len = base.chars().count();
        let insert = Edit::insert(((pos_pct * len as f64) as usize).min(len), "XYZ");
        let other = realize(&del, len);

        let text = apply_to_str(
            &apply_to_str(&base, [&other]).unwrap(),
            &transform(&insert, &other, Tie::AgainstFirst),
        ).unwrap();
        prop_assert!(text.contains("XYZ"));
    }

    #[test]
    fn transformed_cursor_stays_in_bounds(
        base in base_text(),
        pos_pct in 0.0..=1.0f64,
        seed in edit_seed(),
    ) {
        let len = base.chars().count();
        let cursor = ((pos_pct * len as f64) as usize).min(len);
        let edit = realize(&seed, len);
        let after = apply_to_str(&base, [&edit]).unwrap();
        prop_assert!(transform_position(cursor, &edit) <= after.chars().count());
    }
}

// =============================================================================
// End-to-end simulation
// =============================================================================

#[derive(Clone, Debug)]
enum Action {
    /// A client edits its local copy
    Local { client: usize, seed: EditSeed },
    /// Deliver the oldest message from a client to the server
    Upload { client: usize },
    /// Deliver the oldest message from the server to a client
    Download { client: usize },
}

fn action(clients: usize) -> impl Strategy<Value = Action> {
    prop_oneof![
        (0..clients, edit_seed()).prop_map(|(client, seed)| Action::Local { client, seed }),
        (0..clients).prop_map(|client| Action::Upload { client }),
        (0..clients).prop_map(|client| Action::Download { client }),
    ]
}

struct Submit {
    client_op_id: String,
    base_seq: u64,
    edit: Edit,
}

enum Downstream {
    Ack(Ack),
    Op(Operation),
}

/// Minimal sequencer with the same rules as a document session.
struct Sequencer {
    text: String,
    history: Vec<Edit>,
}

impl Sequencer {
    fn submit(&mut self, author: usize, sub: Submit, peers: &mut [VecDeque<Downstream>]) {
        let concurrent = &self.history[sub.base_seq as usize..];
        let applied = transform_against_history(&sub.edit, concurrent);
        self.text = apply_to_str(&self.text, &applied).unwrap();

        for edit in &applied {
            self.history.push(edit.clone());
            let op = Operation {
                id: format!("op-{}", self.history.len()),
                doc_id: "doc".into(),
                version: VersionId::GENESIS,
                seq: self.history.len() as u64,
                author: format!("user-{author}"),
                client_op_id: sub.client_op_id.clone(),
                edit: edit.clone(),
                epoch: 0,
                timestamp: 0,
            };
            for (i, queue) in peers.iter_mut().enumerate() {
                if i != author {
                    queue.push_back(Downstream::Op(op.clone()));
                }
            }
        }
        peers[author].push_back(Downstream::Ack(Ack {
            client_op_id: sub.client_op_id,
            seq: self.history.len() as u64,
            applied,
        }));
    }
}

struct Sim {
    server: Sequencer,
    clients: Vec<ClientDocument>,
    up: Vec<VecDeque<Submit>>,
    down: Vec<VecDeque<Downstream>>,
}

impl Sim {
    fn new(base: &str, n: usize) -> Self {
        let seed: Vec<Edit> = if base.is_empty() {
            Vec::new()
        } else {
            vec![Edit::insert(0, base)]
        };
        Self {
            server: Sequencer {
                text: base.to_string(),
                history: seed.clone(),
            },
            clients: (0..n)
                .map(|i| ClientDocument::new(format!("c{i}"), base, seed.len() as u64))
                .collect(),
            up: (0..n).map(|_| VecDeque::new()).collect(),
            down: (0..n).map(|_| VecDeque::new()).collect(),
        }
    }

    fn queue_submission(&mut self, client: usize, sub: Option<scrivener_core::ot::Submission>) {
        if let Some(sub) = sub {
            self.up[client].push_back(Submit {
                client_op_id: sub.client_op_id,
                base_seq: sub.base_seq,
                edit: sub.edit,
            });
        }
    }

    fn step(&mut self, action: &Action) {
        match action {
            Action::Local { client, seed } => {
                let len = self.clients[*client].text().chars().count();
                let edit = realize(seed, len);
                let sub = self.clients[*client].apply_local(edit).unwrap();
                self.queue_submission(*client, sub);
            }
            Action::Upload { client } => {
                if let Some(sub) = self.up[*client].pop_front() {
                    self.server.submit(*client, sub, &mut self.down);
                }
            }
            Action::Download { client } => match self.down[*client].pop_front() {
                Some(Downstream::Op(op)) => self.clients[*client].apply_remote(&op).unwrap(),
                Some(Downstream::Ack(ack)) => {
                    let next = self.clients[*client].acknowledge(&ack).unwrap();
                    self.queue_submission(*client, next);
                }
                None => {}
            },
        }
    }

    fn drain(&mut self) {
        loop {
            let mut progressed = false;
            for client in 0..self.clients.len() {
                if !self.up[client].is_empty() {
                    self.step(&Action::Upload { client });
                    progressed = true;
                }
                if !self.down[client].is_empty() {
                    self.step(&Action::Download { client });
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn clients_converge_with_the_server(
        base in base_text(),
        actions in prop::collection::vec(action(3), 1..60),
    ) {
        let mut sim = Sim::new(&base, 3);
        for action in &actions {
            sim.step(action);
        }
        sim.drain();

        for client in &sim.clients {
            prop_assert!(client.is_synced());
            prop_assert_eq!(client.text(), sim.server.text.clone());
            prop_assert_eq!(client.server_seq(), sim.server.history.len() as u64);
        }
    }
}

#[test]
fn hello_world_in_both_arrival_orders() {
    for delete_first in [true, false] {
        let mut sim = Sim::new("Hello!", 2);
        sim.step(&Action::Local {
            client: 0,
            seed: EditSeed::Insert {
                pos_pct: 5.0 / 6.0,
                text: ", world".into(),
            },
        });
        sim.step(&Action::Local {
            client: 1,
            seed: EditSeed::Delete {
                pos_pct: 5.0 / 6.0,
                len_pct: 1.0,
            },
        });

        let order = if delete_first { [1, 0] } else { [0, 1] };
        for client in order {
            sim.step(&Action::Upload { client });
        }
        sim.drain();

        assert_eq!(sim.server.text, "Hello, world");
        for client in &sim.clients {
            assert_eq!(client.text(), "Hello, world");
        }
    }
}
