//! Umbrella crate tying the mesh together: a self-certifying hashname
//! identity, end-to-end encrypted exchanges between peers, a dispatcher
//! that demultiplexes inbound packets onto them, and a chunking engine for
//! carrying that traffic over bandwidth-limited transports.
//!
//! Each concern lives in its own crate (`lob`, `hashname`, `cipherset`,
//! `link`, `frames`, `mesh`) so that, for example, a deployment that only
//! needs the framing engine over a serial link doesn't have to pull in
//! the dispatcher. This crate just re-exports them under one name and
//! exercises them together end to end.

pub use cipherset::{CipherError, LocalIdentity, CSID};
pub use frames::{Frames, FramesError};
pub use hashname::Hashname;
pub use link::{Link, LinkError};
pub use lob::{Kind, LobError, Packet};
pub use mesh::{Mesh, MeshError};
