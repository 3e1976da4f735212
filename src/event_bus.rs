/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives published [`Event`]s and fires the registered handlers.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::Event, logging::Logger};

pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// How long the event bus waits for an event before checking for the shutdown signal again.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) struct EventHandlers {
    pub(crate) handlers: Vec<HandlerPtr<Event>>,
}

impl EventHandlers {
    /// Collect the user's `handlers`, prepended with the default logger if `log_events` is set.
    pub(crate) fn new(log_events: bool, handlers: Vec<HandlerPtr<Event>>) -> EventHandlers {
        let mut all_handlers = Vec::with_capacity(handlers.len() + 1);
        if log_events {
            all_handlers.push(Event::get_logger());
        }
        all_handlers.extend(handlers);
        EventHandlers {
            handlers: all_handlers,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        self.handlers.iter().for_each(|handler| handler(&event))
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
