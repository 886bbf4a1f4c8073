// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use alloc::sync::Arc;
use core::error::Error as StdError;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;

use tokio::sync::oneshot;

use jid::Jid;
use minidom::Element;

use super::request::{Request, RequestKey};
use super::{RequestError, DEFAULT_TIMEOUT};
use crate::event::make_id;
use crate::ns;
use crate::sm::StanzaToken;

type Stage<V> = Box<dyn FnOnce(Result<Element, RequestError>) -> Result<V, RequestError> + Send>;
type Handler<V> = Box<dyn FnOnce(Result<V, RequestError>) + Send>;

/// Something requests can be written to.
pub trait RequestWriter {
    /// Send a request, keeping track of its reply if it expects one.
    fn write(&mut self, request: Request) -> StanzaToken;
}

/// Returned by [`RequestBuilder::send`].
#[derive(Debug)]
pub struct RequestHandle {
    key: RequestKey,
    token: StanzaToken,
}

impl RequestHandle {
    /// Key under which the request is tracked.
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Delivery state of the stanza.
    pub fn token(&self) -> &StanzaToken {
        &self.token
    }

    /// Split the handle into its parts.
    pub fn into_parts(self) -> (RequestKey, StanzaToken) {
        (self.key, self.token)
    }
}

/// Creates [`RequestBuilder`]s with common defaults.
#[derive(Debug, Clone)]
pub struct RequestBuilderFactory {
    default_timeout: Duration,
}

impl Default for RequestBuilderFactory {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl RequestBuilderFactory {
    /// Create a factory whose requests wait `default_timeout` for a reply.
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Start a request for an arbitrary IQ stanza.
    pub fn iq(&self, stanza: Element) -> RequestBuilder<Element> {
        RequestBuilder::new(stanza, self.default_timeout)
    }

    /// Start a `type="get"` IQ carrying `payload`.
    pub fn iq_get(&self, to: Option<Jid>, payload: Element) -> RequestBuilder<Element> {
        self.iq(build_iq("get", to, payload))
    }

    /// Start a `type="set"` IQ carrying `payload`.
    pub fn iq_set(&self, to: Option<Jid>, payload: Element) -> RequestBuilder<Element> {
        self.iq(build_iq("set", to, payload))
    }

    /// Start a message. It is resolved once it is handed to the transport.
    pub fn message(&self, stanza: Element) -> RequestBuilder<Element> {
        RequestBuilder::new(stanza, self.default_timeout)
    }

    /// Start a presence. It is resolved once it is handed to the transport.
    pub fn presence(&self, stanza: Element) -> RequestBuilder<Element> {
        RequestBuilder::new(stanza, self.default_timeout)
    }
}

fn build_iq(type_: &str, to: Option<Jid>, payload: Element) -> Element {
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", type_)
        .attr("to", to.map(|jid| jid.to_string()))
        .append(payload)
        .build()
}

/// Incremental construction of a [`Request`].
///
/// Every [`map`][`Self::map`] starts a new stage. Handlers attached with
/// [`response`][`Self::response`] observe the value of the stage they were
/// attached to; transforms run at most once per resolution no matter how
/// many handlers are stacked on top of them.
#[must_use = "a request does nothing until it is sent"]
pub struct RequestBuilder<V> {
    stanza: Element,
    key: RequestKey,
    to: Option<Jid>,
    label: Option<String>,
    timeout: Duration,
    stage: Stage<V>,
    handlers: Vec<Handler<V>>,
}

impl RequestBuilder<Element> {
    fn new(mut stanza: Element, timeout: Duration) -> Self {
        let id = match stanza.attr("id") {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => {
                let id = make_id();
                stanza.set_attr("id", id.clone());
                id
            }
        };
        let key = RequestKey {
            name: stanza.name().to_owned(),
            id,
        };
        let to = stanza.attr("to").and_then(|to| Jid::new(to).ok());
        Self {
            stanza,
            key,
            to,
            label: None,
            timeout,
            stage: Box::new(|result| result),
            handlers: Vec::new(),
        }
    }
}

impl<V: Clone + Send + 'static> RequestBuilder<V> {
    /// Key under which the request will be tracked.
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Override how long to wait for a reply.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Label the request in logs.
    pub fn name<S: Into<String>>(mut self, label: S) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Attach a handler to the current stage.
    ///
    /// Handlers of one stage are invoked in the order they were attached.
    pub fn response<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(Result<V, RequestError>) + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Start a new stage whose value is `transform` applied to the value of
    /// the current one.
    pub fn map<W, F>(self, transform: F) -> RequestBuilder<W>
    where
        W: Clone + Send + 'static,
        F: FnOnce(V) -> W + Send + 'static,
    {
        self.chain(move |result| result.map(transform))
    }

    /// Like [`map`][`Self::map`], for transforms which can fail.
    ///
    /// An error of the transform fails this stage and all later ones.
    pub fn try_map<W, E, F>(self, transform: F) -> RequestBuilder<W>
    where
        W: Clone + Send + 'static,
        F: FnOnce(V) -> Result<W, E> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.chain(move |result| {
            result.and_then(|value| {
                transform(value).map_err(|e| RequestError::Transform(Arc::new(e)))
            })
        })
    }

    fn chain<W, F>(self, next: F) -> RequestBuilder<W>
    where
        W: Clone + Send + 'static,
        F: FnOnce(Result<V, RequestError>) -> Result<W, RequestError> + Send + 'static,
    {
        let Self {
            stanza,
            key,
            to,
            label,
            timeout,
            stage,
            handlers,
        } = self;
        let sealed = seal(stage, handlers);
        RequestBuilder {
            stanza,
            key,
            to,
            label,
            timeout,
            stage: Box::new(move |input| next(sealed(input))),
            handlers: Vec::new(),
        }
    }

    /// Finish the builder without sending it.
    pub fn build(self) -> Request {
        let sealed = seal(self.stage, self.handlers);
        Request::new(
            self.stanza,
            self.key,
            self.to,
            self.label,
            self.timeout,
            Box::new(move |input| {
                let _: Result<V, RequestError> = sealed(input);
            }),
        )
    }

    /// Hand the request to `writer`.
    pub fn send<W: RequestWriter + ?Sized>(self, writer: &mut W) -> RequestHandle {
        let key = self.key.clone();
        let token = writer.write(self.build());
        RequestHandle { key, token }
    }

    /// Hand the request to `writer` and return a future which resolves with
    /// the value of the last stage.
    pub fn send_and_wait<W: RequestWriter + ?Sized>(
        self,
        writer: &mut W,
    ) -> (RequestHandle, ResponseToken<V>) {
        let (tx, rx) = oneshot::channel();
        let handle = self
            .response(move |result| {
                let _: Result<_, _> = tx.send(result);
            })
            .send(writer);
        (handle, ResponseToken { inner: rx })
    }
}

/// Run the handlers of a stage after computing its value.
fn seal<V: Clone + Send + 'static>(stage: Stage<V>, handlers: Vec<Handler<V>>) -> Stage<V> {
    if handlers.is_empty() {
        return stage;
    }
    Box::new(move |input| {
        let value = stage(input);
        for handler in handlers {
            handler(value.clone());
        }
        value
    })
}

pin_project_lite::pin_project! {
    /// Handle for awaiting the value of a request.
    ///
    /// Unlike a bare IQ tracker, this future always completes: the request
    /// is failed with a `remote-server-timeout` condition if no reply
    /// arrives in time.
    pub struct ResponseToken<V> {
        #[pin]
        inner: oneshot::Receiver<Result<V, RequestError>>,
    }
}

impl<V> Future for ResponseToken<V> {
    type Output = Result<V, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(v)) => Poll::Ready(v),
            Poll::Ready(Err(_)) => {
                log::warn!("ResponseToken oneshot::Receiver returned receive error!");
                Poll::Ready(Err(RequestError::LostWorker))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt;
    use std::sync::Mutex;

    use crate::sm::QueueEntry;

    /// Collects written requests instead of sending them.
    #[derive(Default)]
    struct Collector {
        requests: Vec<Request>,
    }

    impl RequestWriter for Collector {
        fn write(&mut self, request: Request) -> StanzaToken {
            let (_, token) = QueueEntry::tracked(request.stanza().clone());
            self.requests.push(request);
            token
        }
    }

    fn reply(id: &str, payload: &str) -> Element {
        format!(
            "<iq xmlns='jabber:client' type='result' id='{}' from='a@b'><value xmlns='test'>{}</value></iq>",
            id, payload
        )
        .parse()
        .unwrap()
    }

    fn payload_text(elem: Element) -> String {
        elem.get_child("value", "test")
            .map(|v| v.text())
            .unwrap_or_default()
    }

    #[test]
    fn assigns_id_and_key() {
        let factory = RequestBuilderFactory::default();
        let builder = factory.iq_get(
            Some(Jid::new("a@b").unwrap()),
            Element::builder("query", "test").build(),
        );
        assert_eq!(builder.key().name, "iq");
        assert!(!builder.key().id.is_empty());

        let request = builder.build();
        assert_eq!(request.stanza().attr("id"), Some(request.key().id.as_str()));
        assert_eq!(request.stanza().attr("to"), Some("a@b"));
        assert_eq!(request.stanza().attr("type"), Some("get"));
        assert_eq!(request.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn keeps_existing_id() {
        let stanza: Element = "<iq xmlns='jabber:client' type='get' id='r1'/>".parse().unwrap();
        let request = RequestBuilderFactory::default().iq(stanza).build();
        assert_eq!(request.key().id, "r1");
    }

    #[test]
    fn map_payload_to_integer() {
        let stanza: Element = "<iq xmlns='jabber:client' type='get' id='r1' to='a@b'/>"
            .parse()
            .unwrap();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let mut request = RequestBuilderFactory::default()
            .iq(stanza)
            .map(payload_text)
            .try_map(|text| text.parse::<i32>())
            .response(move |result| *sink.lock().unwrap() = Some(result))
            .build();

        assert!(request.set_response_stanza(&reply("r1", "1234")));
        let result = seen.lock().unwrap().take().unwrap();
        assert_eq!(result.unwrap(), 1234);
    }

    #[test]
    fn stacked_transforms_run_once() {
        let stanza: Element = "<iq xmlns='jabber:client' type='get' id='r1'/>".parse().unwrap();
        let calls = Arc::new(Mutex::new(Vec::<String>::new()));

        let log = |calls: &Arc<Mutex<Vec<String>>>, tag: &'static str| {
            let calls = calls.clone();
            move |value: String| calls.lock().unwrap().push(format!("{}:{}", tag, value))
        };
        let first_map = calls.clone();
        let second_map = calls.clone();
        let h1 = log(&calls, "h1");
        let h1_again = log(&calls, "h1");
        let h2 = log(&calls, "h2");
        let h3 = log(&calls, "h3");

        let mut request = RequestBuilderFactory::default()
            .iq(stanza)
            .map(move |elem| {
                first_map.lock().unwrap().push("map1".to_owned());
                payload_text(elem).parse::<i32>().unwrap_or(0)
            })
            .response(move |v| h1(v.unwrap().to_string()))
            .response(move |v| h1_again(v.unwrap().to_string()))
            .map(move |v| {
                second_map.lock().unwrap().push("map2".to_owned());
                v + 2
            })
            .response(move |v| h2(v.unwrap().to_string()))
            .response(move |v| h3(v.unwrap().to_string()))
            .build();

        request.set_response_stanza(&reply("r1", "1234"));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["map1", "h1:1234", "h1:1234", "map2", "h2:1236", "h3:1236"]
        );
    }

    #[test]
    fn timeout_skips_transforms() {
        let stanza: Element = "<iq xmlns='jabber:client' type='get' id='r1'/>".parse().unwrap();
        let transforms = Arc::new(Mutex::new(0));
        let failures = Arc::new(Mutex::new(0));
        let t = transforms.clone();
        let f1 = failures.clone();
        let f2 = failures.clone();

        let mut request = RequestBuilderFactory::default()
            .iq(stanza)
            .response(move |r| {
                assert!(r.unwrap_err().is_timeout());
                *f1.lock().unwrap() += 1;
            })
            .map(move |_| {
                *t.lock().unwrap() += 1;
            })
            .response(move |r| {
                assert!(r.unwrap_err().is_timeout());
                *f2.lock().unwrap() += 1;
            })
            .build();

        assert!(request.mark_timeout());
        assert_eq!(*transforms.lock().unwrap(), 0);
        assert_eq!(*failures.lock().unwrap(), 2);
    }

    #[derive(Debug)]
    struct Rejected;

    impl fmt::Display for Rejected {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("rejected")
        }
    }

    impl StdError for Rejected {}

    #[test]
    fn failing_transform_fails_later_stages() {
        let stanza: Element = "<iq xmlns='jabber:client' type='get' id='r1'/>".parse().unwrap();
        let before = Arc::new(Mutex::new(None));
        let after = Arc::new(Mutex::new(None));
        let b = before.clone();
        let a = after.clone();

        let mut request = RequestBuilderFactory::default()
            .iq(stanza)
            .response(move |r| *b.lock().unwrap() = Some(r.is_ok()))
            .try_map(|_| Err::<u8, _>(Rejected))
            .map(|v| v + 1)
            .response(move |r| *a.lock().unwrap() = Some(r))
            .build();

        request.set_response_stanza(&reply("r1", "x"));
        assert_eq!(*before.lock().unwrap(), Some(true));
        let result = after.lock().unwrap().take();
        match result {
            Some(Err(RequestError::Transform(e))) => assert_eq!(e.to_string(), "rejected"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn send_hands_request_to_writer() {
        let mut collector = Collector::default();
        let stanza: Element = "<presence xmlns='jabber:client'/>".parse().unwrap();
        let handle = RequestBuilderFactory::default()
            .presence(stanza)
            .name("initial presence")
            .send(&mut collector);
        assert_eq!(handle.key().name, "presence");
        assert_eq!(collector.requests.len(), 1);
        assert_eq!(collector.requests[0].label(), Some("initial presence"));
        assert!(collector.requests[0].is_fire_and_forget());
    }

    #[tokio::test]
    async fn response_token_resolves() {
        let mut collector = Collector::default();
        let stanza: Element = "<iq xmlns='jabber:client' type='get' id='r9'/>".parse().unwrap();
        let (_, token) = RequestBuilderFactory::default()
            .iq(stanza)
            .map(payload_text)
            .send_and_wait(&mut collector);
        let mut request = collector.requests.pop().unwrap();
        request.set_response_stanza(&reply("r9", "hello"));
        assert_eq!(token.await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn response_token_reports_lost_request() {
        let mut collector = Collector::default();
        let stanza: Element = "<iq xmlns='jabber:client' type='get' id='r9'/>".parse().unwrap();
        let (_, token) = RequestBuilderFactory::default()
            .iq(stanza)
            .send_and_wait(&mut collector);
        drop(collector);
        assert!(matches!(token.await, Err(RequestError::LostWorker)));
    }
}
