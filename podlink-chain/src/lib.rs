#![forbid(unsafe_code)]

//! Node/chain/route configuration model and router lifecycle (spec
//! §3 Node/Node group/Chain/Route/Router, §4.8, §6 Lifecycle surface).

pub mod chain;
pub mod group;
pub mod node;
pub mod route;
pub mod router;

pub use chain::{Chain, ChainConnection};
pub use group::NodeGroup;
pub use node::{parse_chain_node, parse_node, Node, Protocol, Transport};
pub use route::{build_routers, RouteSpec};
pub use router::{Router, TcpHandlerKind};
