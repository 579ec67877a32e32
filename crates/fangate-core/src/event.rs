//! Session event sum type.
//!
//! Every event an upstream session can emit is a variant here, so
//! consumers (the gateway event loop, the analytics services) match
//! exhaustively instead of dispatching on string event names.

use crate::types::{M1Bar, SessionState, Source, SymbolDataPackage, Tick};

/// Event emitted by an upstream session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Normalized top-of-book tick.
    Tick(Tick),
    /// Live one-minute bar.
    M1Bar(M1Bar),
    /// One-shot bootstrap package for a symbol.
    Package(Box<SymbolDataPackage>),
    /// The tick stream stopped while the connection stayed open.
    Stale { source: Source },
    /// The tick stream resumed after a stale interval.
    TickResumed { source: Source },
    /// Lifecycle state transition.
    StateChanged { source: Source, state: SessionState },
    /// Per-symbol failure (symbol not found, empty series, timeout).
    /// Isolated to the affected symbol; the session stays up.
    SymbolError {
        source: Source,
        symbol: String,
        message: String,
    },
}

impl SessionEvent {
    /// The source a routed event belongs to.
    pub fn source(&self) -> Source {
        match self {
            Self::Tick(t) => t.source,
            Self::M1Bar(b) => b.source,
            Self::Package(p) => p.source,
            Self::Stale { source }
            | Self::TickResumed { source }
            | Self::StateChanged { source, .. }
            | Self::SymbolError { source, .. } => *source,
        }
    }
}
