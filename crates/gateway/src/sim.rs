//! Scripted upstream for `--demo` runs: replays the bot's lookup dialog
//! (first reply, edit that adds candidate buttons, summary burst) against a
//! small built-in directory, so the whole pipeline can be exercised without
//! a real account.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use inngate_engine::{UpstreamError, UpstreamEvent, UpstreamMessage, UpstreamTransport};

struct Person {
    inn: &'static str,
    fio: &'static str,
    phone: &'static str,
    email: &'static str,
}

/// Querying this INN replays the upstream's day-limit notice on click.
const LIMIT_INN: &str = "0000000000";

const DIRECTORY: [Person; 4] = [
    Person {
        inn: "2222058686",
        fio: "Маркова Ольга Викторовна",
        phone: "+7 903 000-00-00",
        email: "o@x.ru",
    },
    Person {
        inn: "7701234567",
        fio: "Иванов Иван Иванович",
        phone: "+7 495 111-22-33",
        email: "ivanov@example.ru",
    },
    Person {
        inn: "7701234567",
        fio: "Иванова Анна Петровна",
        phone: "+7 495 444-55-66",
        email: "a.ivanova@example.ru",
    },
    Person {
        inn: LIMIT_INN,
        fio: "Лимитов Лимит Лимитович",
        phone: "",
        email: "",
    },
];

const REPLY_DELAY: Duration = Duration::from_millis(300);

#[derive(Default)]
struct SimState {
    next_id: i64,
    // message id of a first reply -> candidates offered on its buttons
    offers: HashMap<i64, Vec<usize>>,
}

impl SimState {
    fn bump_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct SimulatedUpstream {
    state: Mutex<SimState>,
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<UpstreamEvent>>>>,
}

impl SimulatedUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::default()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Emits after a short delay, to whoever is subscribed by then; this
    /// mimics the upstream editing its reply a beat after sending it.
    fn emit_later(&self, event: UpstreamEvent) {
        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REPLY_DELAY).await;
            let subscribers = subscribers.lock().unwrap_or_else(|e| e.into_inner());
            for tx in subscribers.iter() {
                let _ = tx.send(event.clone());
            }
        });
    }
}

#[async_trait]
impl UpstreamTransport for SimulatedUpstream {
    async fn send_and_wait(
        &self,
        text: &str,
        _timeout: Duration,
    ) -> Result<UpstreamMessage, UpstreamError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.bump_id();

        let Some(inn) = text.strip_prefix("/inn ").map(str::trim) else {
            return Ok(UpstreamMessage {
                id,
                text: "Неизвестная команда. Используйте /inn <номер>.".to_string(),
                buttons: Vec::new(),
            });
        };

        let matches: Vec<usize> = DIRECTORY
            .iter()
            .enumerate()
            .filter(|(_, p)| p.inn == inn)
            .map(|(i, _)| i)
            .collect();
        if matches.is_empty() {
            return Ok(UpstreamMessage {
                id,
                text: format!("По ИНН {inn} ничего не найдено."),
                buttons: Vec::new(),
            });
        }

        let buttons = matches
            .iter()
            .map(|&i| vec![DIRECTORY[i].fio.to_string()])
            .collect();
        state.offers.insert(id, matches);
        drop(state);

        self.emit_later(UpstreamEvent::Edited(UpstreamMessage {
            id,
            text: "Выберите кандидата:".to_string(),
            buttons,
        }));
        Ok(UpstreamMessage {
            id,
            text: format!("🔎 Ищу данные по ИНН {inn}…"),
            buttons: Vec::new(),
        })
    }

    async fn subscribe(&self) -> mpsc::UnboundedReceiver<UpstreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.push(tx);
        rx
    }

    async fn click(&self, message_id: i64, row: usize, _col: usize) -> Result<(), UpstreamError> {
        let (id, text) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let person = state
                .offers
                .get(&message_id)
                .and_then(|offers| offers.get(row))
                .map(|&i| &DIRECTORY[i]);
            let text = match person {
                Some(p) if p.inn == LIMIT_INN => {
                    "⚠️ Лимит запросов на сегодня временно исчерпан.".to_string()
                }
                Some(p) => format!(
                    "📄 Краткая сводка\nИНН: {}\nФИО: {}\nТелефон: {}\nEmail: {}",
                    p.inn, p.fio, p.phone, p.email
                ),
                None => return Err(UpstreamError::Rpc("BUTTON_INVALID".to_string())),
            };
            (state.bump_id(), text)
        };

        self.emit_later(UpstreamEvent::New(UpstreamMessage {
            id,
            text,
            buttons: Vec::new(),
        }));
        Ok(())
    }
}
