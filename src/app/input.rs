use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::lifecycle::NodeState;

use super::state::{PendingAction, PendingActionKind, StatusLevel, TextInput};
use super::App;

/// Result of handling a key: Quit the app, or key was consumed (needs render).
/// None means the key was not handled.
pub enum InputResult {
    Quit,
    Consumed,
}

/// Handle a key event. Returns Some(Quit) to exit, Some(Consumed) if key was handled and
/// a render is needed, None if the key was not handled.
pub fn handle_key(app: &mut App, key_event: KeyEvent) -> Option<InputResult> {
    let KeyEvent { code, modifiers, .. } = key_event;

    if code == KeyCode::Char('c') && modifiers.contains(KeyModifiers::CONTROL) {
        return Some(InputResult::Quit);
    }

    if app.input.is_some() {
        handle_text_input(app, code);
        return Some(InputResult::Consumed);
    }

    if let Some(pa) = app.pending_action.take() {
        if code == KeyCode::Char('y') || code == KeyCode::Char('Y') {
            match pa.kind {
                PendingActionKind::Stop(node) => app.session.request_stop(&node),
                PendingActionKind::Remove { node, keep_record } => {
                    app.session.request_remove(&node, keep_record)
                }
                PendingActionKind::ResetAddress(node) => {
                    if !app.session.request_reset_address(&node) {
                        app.feed
                            .lock()
                            .set(StatusLevel::Warning, format!("{} is no longer selected; reset cancelled", node));
                    }
                }
            }
        }
        return Some(InputResult::Consumed);
    }

    handle_nodes(app, code)
}

fn handle_text_input(app: &mut App, code: KeyCode) {
    let Some(input) = app.input.as_mut() else {
        return;
    };
    match code {
        KeyCode::Esc => app.input = None,
        KeyCode::Enter => {
            if let Some(input) = app.input.take() {
                let alias = input.buffer.trim();
                if alias.is_empty() {
                    app.feed.lock().set(StatusLevel::Warning, "Alias cannot be empty");
                } else {
                    app.session.request_rename(&input.node, alias);
                }
            }
        }
        KeyCode::Backspace => {
            input.buffer.pop();
        }
        KeyCode::Char(c) => input.buffer.push(c),
        _ => {}
    }
}

fn handle_nodes(app: &mut App, code: KeyCode) -> Option<InputResult> {
    match code {
        KeyCode::Char('q') | KeyCode::Esc => return Some(InputResult::Quit),
        KeyCode::Up | KeyCode::Char('k') => {
            if app.move_selection(-1) {
                return Some(InputResult::Consumed);
            }
        }
        KeyCode::Down | KeyCode::Char('j') => {
            if app.move_selection(1) {
                return Some(InputResult::Consumed);
            }
        }
        KeyCode::Char('a') => {
            app.session.request_add_node();
            app.feed.lock().set(StatusLevel::Info, "Allocating a new node...");
            return Some(InputResult::Consumed);
        }
        KeyCode::Char('i') => {
            let started = app.session.request_image_check();
            let text = if started { "Checking for a newer image..." } else { "Image check already running" };
            app.feed.lock().set(StatusLevel::Info, text);
            return Some(InputResult::Consumed);
        }
        _ => {}
    }

    // Everything below acts on the selected node.
    let node = app.session.active()?.to_string();
    let running = app.session.state(&node) == Some(NodeState::Running);
    match code {
        KeyCode::Char('s') => {
            if running {
                app.feed.lock().set(StatusLevel::Info, format!("{} is already running", node));
            } else {
                app.session.request_start(&node);
            }
        }
        KeyCode::Char('t') => app.pending_action = Some(PendingAction::new(PendingActionKind::Stop(node))),
        KeyCode::Char('d') => {
            app.pending_action = Some(PendingAction::new(PendingActionKind::Remove {
                node,
                keep_record: false,
            }))
        }
        KeyCode::Char('D') => {
            app.pending_action = Some(PendingAction::new(PendingActionKind::Remove {
                node,
                keep_record: true,
            }))
        }
        KeyCode::Char('r') if running => {
            let current = app.session.identity().map(|i| i.alias.clone()).unwrap_or_default();
            app.input = Some(TextInput { node, buffer: current });
        }
        KeyCode::Char('w') if running => {
            app.session.request_allowed();
        }
        KeyCode::Char('c') if running => {
            app.session.request_startup_config();
        }
        KeyCode::Char('C') if running => {
            app.session.request_config_app();
        }
        KeyCode::Char('R') if running => {
            app.pending_action = Some(PendingAction::new(PendingActionKind::ResetAddress(node)))
        }
        KeyCode::Char('r' | 'w' | 'c' | 'C' | 'R') => {
            app.feed.lock().set(StatusLevel::Warning, format!("{} is not running", node));
        }
        _ => return None,
    }
    Some(InputResult::Consumed)
}
