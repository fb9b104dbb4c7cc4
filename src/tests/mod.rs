//! Cross-module tests: the connection manager against scripted sockets, the
//! store as a live sink, a real WebSocket server and a stub HTTP backend.

mod support;
