/// Node runtime — one `MeshNode` owns an instance of every component.
///
/// The node wires transport callbacks into the forwarding layer, runs the
/// dispatch loop and the monitor loop as tokio tasks, and reports to the
/// application through a `MeshEvent` channel. There are no globals: a
/// process can run many nodes side by side (the simulator does).
mod r#loop;
mod node;

pub use node::{HealthReport, MeshNode};
