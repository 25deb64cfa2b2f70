/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*. It provides two levels of
functionality.

 * First, it provides functions to extract fields from sequences of octets, and to insert fields
   into sequences of octets. This happens in the lowercase structures, e.g. [`ipv4_packet`] or
   [`tcp_packet`].
 * Second, it provides a compact, high-level representation of header data that can be created
   from parsing and emitted into a sequence of octets. This happens through the `Repr` family of
   structs, e.g. [`Ipv4Repr`] or [`TcpRepr`].

[`ipv4_packet`]: struct.ipv4_packet.html
[`tcp_packet`]: struct.tcp_packet.html
[`Ipv4Repr`]: struct.Ipv4Repr.html
[`TcpRepr`]: struct.TcpRepr.html

The `packet` family of data structures guarantees that, if the `check_len()` method returned
`Ok(())`, then no field accessor or setter method will panic. When parsing untrusted input it is
*necessary* to use `new_checked`; so long as the buffer is not modified, no accessor will fail.

In the `Repr` family of data structures, the `parse()` method never panics and the `emit()`
method never panics as long as the underlying buffer is at least `buffer_len()` octets long.
*/
// Copyright (C) 2016 whitequark@whitequark.org
// Copyright (C) 2019 Andreas Molzer <andreas.molzer@tum.de>
//
// in large parts from `smoltcp` originally distributed under 0-clause BSD
//
// Applies to files in this folder unless otherwise noted. These are:
// * `error.rs`
// * `ip.rs`
// * `ipv4.rs`
// * `mod.rs` (this file)
// * `tcp.rs`

mod field {
    pub(crate) type Field = ::core::ops::Range<usize>;
}

mod error;
pub(crate) mod ip;
mod ipv4;
mod tcp;

pub use self::error::{
    Error,
    Result};

pub use self::ip::{
    Checksum,
    Protocol as IpProtocol};

pub use self::ipv4::{
    ipv4 as ipv4_packet,
    Address as Ipv4Address,
    Repr as Ipv4Repr,
    HEADER_LEN as IPV4_HEADER_LEN,
    MIN_MTU as IPV4_MIN_MTU};

pub use self::tcp::{
    tcp as tcp_packet,
    Flags as TcpFlags,
    Repr as TcpRepr,
    SeqNumber as TcpSeqNumber,
    TcpOption,
    HEADER_LEN as TCP_HEADER_LEN,
    MAX_OPTIONS_LEN as TCP_MAX_OPTIONS_LEN};

/// Combined length of the IPv4 and TCP base headers.
///
/// Subtracting this from an interface MTU or a path MTU yields the corresponding maximum segment
/// size.
pub const IPV4_TCP_HEADER_LEN: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN;
