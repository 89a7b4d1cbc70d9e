//! Host name resolution used by endpoint resolution.
//!
//! The [`Resolve`] trait is the seam between endpoints and the system
//! resolver. [`GaiResolver`] runs `getaddrinfo` on the blocking pool;
//! [`DnsResolverWithOverrides`] pins selected names to fixed addresses.

mod gai;
mod resolve;

pub use gai::{GaiResolver, SocketAddrs};
pub use resolve::{Addrs, DnsResolverWithOverrides, Name, Resolve, Resolving};
