#![forbid(unsafe_code)]
#![doc = r#"
uirelay

OpenAI-compatible chat-completions gateway that drives a single headless
web-UI session of a hosted LLM provider. Clients POST /v1/chat/completions;
the gateway serializes requests through a single-consumer queue worker,
drives the UI session to submit prompts, and harvests answers either through
an in-process TLS-intercepting stream proxy or by scraping the DOM.

Crate highlights
- Library: the full request lifecycle core (queue/worker, disconnect
  monitoring, stream proxy + parser, SSE/JSON emission).
- HTTP server (in `server`): the /v1 surface plus health, queue and
  capability endpoints.
- The browser-automation binding stays outside this crate behind the
  `session::UiSession` trait; `session::InMemorySession` is the loopback
  implementation used by the direct-debug launch mode and the tests.

Modules
- `models`: Chat Completions data model.
- `queue`, `worker`, `pipeline`: request lifecycle.
- `stream`: certificate authority, MITM proxy, response parser, frame bus.
- `emitter`: OpenAI-shaped SSE/JSON output.
- `disconnect`, `params`, `prompt`: checkpoints, parameter cache, prompt prep.
- `server`, `auth`, `config`, `util`: HTTP surface and ambient plumbing.
"#]

pub mod auth;
pub mod capabilities;
pub mod catalog;
pub mod config;
pub mod disconnect;
pub mod emitter;
pub mod error;
pub mod models;
pub mod params;
pub mod pipeline;
pub mod prompt;
pub mod queue;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod stream;
pub mod util;
pub mod worker;

// Re-export the types most embedders touch.
pub use crate::config::{Config, LaunchMode};
pub use crate::error::GatewayError;
pub use crate::queue::{Envelope, RequestOutcome, RequestQueue};
pub use crate::session::{ClientLiveness, InMemorySession, SessionError, UiSession};
pub use crate::stream::bus::{StreamBus, StreamFrame, ToolInvocation};
pub use crate::util::AppState;
