//! The default `RequestHandler`/`TransactionCallback` wiring the binary
//! starts with. Resource trees and link-format discovery are out of scope;
//! this `Observer` exposes a single ping resource at `/` (`4.05 Method Not
//! Allowed` for anything but `GET`) and answers every other path with
//! `4.04 Not Found`, logging and counting each exchange against
//! `Statistics`.

use std::sync::Arc;

use coap_codec::message::{Code, Message, Type, option_number};
use coap_core::{
    RequestHandler,
    transaction::TransactionCallback,
};

use crate::statistics::{Stat, Statistics};

#[derive(Clone)]
pub struct Observer {
    statistics: Arc<Statistics>,
}

impl Observer {
    pub fn new(statistics: Arc<Statistics>) -> Self {
        Self { statistics }
    }
}

impl RequestHandler for Observer {
    fn handle_request(&self, request: &Message) -> Message {
        let path = request
            .get_options(option_number::URI_PATH)
            .filter_map(|o| o.as_str().ok())
            .collect::<Vec<_>>()
            .join("/");

        log::debug!("inbound request code={} path=/{path}", request.code);

        let mut response = if path.is_empty() {
            if request.code == Code::GET {
                let mut ok = Message::new(Type::Acknowledgement, Code::CONTENT, request.mid, request.token.clone());
                ok.payload = b"coap-endpoint".to_vec();
                ok
            } else {
                Message::new(Type::Acknowledgement, Code::METHOD_NOT_ALLOWED, request.mid, request.token.clone())
            }
        } else {
            Message::new(Type::Acknowledgement, Code::NOT_FOUND, request.mid, request.token.clone())
        };

        response.kind = if request.is_confirmable() { Type::Acknowledgement } else { Type::NonConfirmable };
        response
    }
}

/// Records `TransactionFinished` against `Statistics` when registered as an
/// outbound `Transaction`'s completion callback.
pub struct StatisticsCallback {
    statistics: Arc<Statistics>,
}

impl StatisticsCallback {
    pub fn new(statistics: Arc<Statistics>) -> Arc<Self> {
        Arc::new(Self { statistics })
    }
}

impl TransactionCallback for StatisticsCallback {
    fn on_finished(&self) {
        self.statistics.record(Stat::TransactionFinished);
    }

    fn on_cancelled(&self) {
        self.statistics.record(Stat::TransactionFinished);
    }
}
