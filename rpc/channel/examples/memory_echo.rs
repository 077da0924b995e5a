//! Unary echo over in-memory sessions.
//!
//! Wires a channel to an in-process server through the memory network and
//! drives both by hand. Run with RUST_LOG=debug to watch the subchannel
//! and picker state changes.

use bytes::Bytes;
use rpc_call::CallEvent;
use rpc_channel::testing::MemoryNetwork;
use rpc_channel::{CallOptions, Channel, ChannelOptions};
use rpc_server::{Server, ServerOptions, ServiceRegistry, UnaryReply, unary};
use std::rc::Rc;
use std::time::Instant;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut registry = ServiceRegistry::new();
    registry
        .register(
            "/echo.Echoer/Say",
            unary(|_metadata, request| Ok(UnaryReply::new(request))),
        )
        .expect("register echo method");
    let registry = Rc::new(registry);

    let network = MemoryNetwork::new();
    let mut channel = Channel::new(
        "ipv4:127.0.0.1:50051",
        Box::new(network.connector()),
        ChannelOptions::default(),
    )
    .expect("create channel");

    let now = Instant::now();
    let call = channel
        .call(CallOptions::new("/echo.Echoer/Say"), now)
        .expect("start call");
    channel.send_message(call, Bytes::from_static(b"hello"));
    channel.half_close(call);
    channel.start_read(call);

    let mut servers: Vec<Server> = Vec::new();
    for _ in 0..16 {
        channel.process(now);
        while let Some((_address, session)) = network.accept() {
            servers.push(Server::new(
                registry.clone(),
                Box::new(session),
                ServerOptions::default(),
            ));
        }
        for server in &mut servers {
            server.process(now);
        }
    }

    for event in channel.poll_events() {
        if let rpc_channel::ChannelEvent::Call { event, .. } = event {
            match event {
                CallEvent::Metadata(metadata) => println!("metadata: {} entries", metadata.len()),
                CallEvent::Message(message) => {
                    println!("message:  {:?}", String::from_utf8_lossy(&message))
                }
                CallEvent::Complete(status) => println!("status:   {}", status),
            }
        }
    }
}
