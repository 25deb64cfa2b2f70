//! The process logic of protocol layers.
//!
//! Each protocol layer is split into two parts; the packet logic contained in `wire` and the
//! processing part in this module. The `ip` module holds the datagram reassembly engine and the
//! receive dispatch glue while the actual send/receive path of the lower IPv4 layer is a
//! collaborator implemented by the embedder. The `tcp` module contains the connection oriented
//! transport engine on top.
pub mod ip;
pub mod tcp;
