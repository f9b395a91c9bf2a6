use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use event_backbone::{
    amqp::AmqpConnector, logging, BackoffPolicy, ConnectionSupervisor, ConsumerOptions, EnvelopeHeader,
    EventConsumer, EventPublisher, HandlerRegistry, Topology,
};

/// Event backbone operations tool
#[derive(Parser, Debug)]
#[command(name = "backbone")]
#[command(about = "Publish, declare and inspect events on the AMQP backbone")]
struct Cli {
    /// Broker URI
    #[arg(long, env = "RABBITMQ_URI")]
    uri: String,

    /// Connection name shown by the broker
    #[arg(long, default_value = "backbone-cli")]
    name: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish one enveloped event
    Publish {
        /// Target exchange
        #[arg(long)]
        exchange: String,

        /// Routing key, also used as the event type
        #[arg(long)]
        routing_key: String,

        /// Payload as a JSON object
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Event type when it differs from the routing key
        #[arg(long)]
        event_type: Option<String>,
    },

    /// Declare exchanges, a queue and its bindings
    Declare(TopologyArgs),

    /// Consume a queue and log every delivery (all deliveries are acked)
    Listen {
        #[command(flatten)]
        topology: TopologyArgs,

        /// Unacked delivery limit
        #[arg(long, default_value = "10")]
        prefetch: u16,
    },
}

#[derive(Args, Debug)]
struct TopologyArgs {
    /// Durable topic exchanges to declare
    #[arg(long = "exchange")]
    exchanges: Vec<String>,

    /// Durable queue to declare
    #[arg(long)]
    queue: String,

    /// Bindings as `exchange:routing_key`
    #[arg(long = "bind")]
    bindings: Vec<String>,

    /// Dead-letter exchange for the queue
    #[arg(long)]
    dead_letter_exchange: Option<String>,
}

impl TopologyArgs {
    fn build(&self) -> Result<Topology> {
        let mut builder = Topology::builder().queue(self.queue.clone());
        for exchange in &self.exchanges {
            builder = builder.topic_exchange(exchange.clone());
        }
        for binding in &self.bindings {
            let Some((exchange, routing_key)) = binding.split_once(':') else {
                bail!("binding `{binding}` is not in exchange:routing_key form");
            };
            if !self.exchanges.iter().any(|e| e == exchange) {
                builder = builder.topic_exchange(exchange);
            }
            builder = builder.bind(exchange, routing_key);
        }
        if let Some(dlx) = &self.dead_letter_exchange {
            builder = builder.dead_letter(dlx.clone());
        }
        Ok(builder.build()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "event_backbone=debug,backbone=debug" } else { "event_backbone=info,backbone=info" };
    logging::init_tracing(default_filter);

    if cli.uri.trim().is_empty() {
        bail!("no broker URI given (use --uri or RABBITMQ_URI)");
    }
    let connector = Arc::new(AmqpConnector::new(cli.name.clone()));

    match cli.command {
        Command::Publish { exchange, routing_key, payload, event_type } => {
            let payload: serde_json::Value = serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let supervisor =
                ConnectionSupervisor::connect(cli.uri, connector, Topology::empty(), BackoffPolicy::default()).await?;
            let publisher = EventPublisher::new(supervisor.clone());
            let event_type = event_type.unwrap_or_else(|| routing_key.clone());
            publisher.publish_as(&exchange, &routing_key, &event_type, payload).await?;
            info!(exchange = %exchange, routing_key = %routing_key, "Event published");
            supervisor.close().await?;
        }
        Command::Declare(args) => {
            let topology = args.build()?;
            let supervisor =
                ConnectionSupervisor::connect(cli.uri, connector, topology, BackoffPolicy::default()).await?;
            info!(queue = %args.queue, "Topology declared");
            supervisor.close().await?;
        }
        Command::Listen { topology, prefetch } => {
            let declared = topology.build()?;
            let supervisor =
                ConnectionSupervisor::connect(cli.uri, connector, declared, BackoffPolicy::default()).await?;

            let handlers = HandlerRegistry::new().fallback_fn(|body: Vec<u8>| async move {
                let header = EnvelopeHeader::peek(&body).unwrap_or_default();
                info!(
                    event_id = ?header.id,
                    event_type = ?header.event_type,
                    timestamp = ?header.timestamp,
                    body = %String::from_utf8_lossy(&body),
                    "Event received"
                );
                Ok(())
            });

            let consumer = EventConsumer::new(supervisor, ConsumerOptions::default());
            consumer.start(prefetch, handlers).await?;
            info!(queue = %topology.queue, "Listening, press Ctrl+C to stop");

            tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
            consumer.close().await?;
        }
    }

    Ok(())
}
