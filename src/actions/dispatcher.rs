use crate::actions::base::{ActionError, ActionResult};
use crate::actions::locator::ElementHandle;
use crate::core::config::ActionConfig;
use crate::dom::processor::first_quad;
use crate::errors::{BrowserAgentError, Result};
use crate::utils::javascript::{
    FOCUS, FOCUS_AND_CLEAR, IS_CHECKED, SCROLL_CHUNK, SCROLL_TO_PERCENT, SELECT_OPTION, SET_VALUE,
    SYNTHETIC_CLICK,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The closed set of interactions the dispatcher knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionMethod {
    Click,
    Fill,
    Type,
    Press,
    SelectOption,
    Hover,
    Check,
    Uncheck,
    ScrollTo,
    NextChunk,
    PrevChunk,
}

impl ActionMethod {
    pub const ALL: [ActionMethod; 11] = [
        ActionMethod::Click,
        ActionMethod::Fill,
        ActionMethod::Type,
        ActionMethod::Press,
        ActionMethod::SelectOption,
        ActionMethod::Hover,
        ActionMethod::Check,
        ActionMethod::Uncheck,
        ActionMethod::ScrollTo,
        ActionMethod::NextChunk,
        ActionMethod::PrevChunk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionMethod::Click => "click",
            ActionMethod::Fill => "fill",
            ActionMethod::Type => "type",
            ActionMethod::Press => "press",
            ActionMethod::SelectOption => "selectOptionFromDropdown",
            ActionMethod::Hover => "hover",
            ActionMethod::Check => "check",
            ActionMethod::Uncheck => "uncheck",
            ActionMethod::ScrollTo => "scrollTo",
            ActionMethod::NextChunk => "nextChunk",
            ActionMethod::PrevChunk => "prevChunk",
        }
    }
}

impl fmt::Display for ActionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionMethod {
    type Err = BrowserAgentError;

    fn from_str(raw: &str) -> Result<Self> {
        let wanted = raw.trim();
        ActionMethod::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ActionError::UnsupportedMethod(raw.to_string()).into())
    }
}

/// Clamps a scroll percentage into `[0, 100]`; NaN scrolls to the top.
pub fn clamp_percentage(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

fn parse_percentage(raw: &str) -> Result<f64> {
    raw.trim()
        .trim_end_matches('%')
        .trim()
        .parse::<f64>()
        .map(clamp_percentage)
        .map_err(|_| ActionError::InvalidParameters(format!("not a percentage: {:?}", raw)).into())
}

fn required_arg<'a>(args: &'a [String], method: ActionMethod) -> Result<&'a str> {
    args.first().map(String::as_str).ok_or_else(|| {
        ActionError::InvalidParameters(format!("{} needs an argument", method)).into()
    })
}

struct KeyDefinition {
    key: String,
    code: String,
    text: Option<String>,
    key_code: Option<i64>,
}

const MODIFIER_ALT: i64 = 1;
const MODIFIER_CTRL: i64 = 2;
const MODIFIER_META: i64 = 4;
const MODIFIER_SHIFT: i64 = 8;

fn key_definition(key: &str) -> KeyDefinition {
    let named = |code: &str, text: Option<&str>, vk: i64| KeyDefinition {
        key: key.to_string(),
        code: code.to_string(),
        text: text.map(str::to_string),
        key_code: Some(vk),
    };

    match key {
        "Enter" => named("Enter", Some("\r"), 13),
        "Tab" => named("Tab", Some("\t"), 9),
        "Escape" => named("Escape", None, 27),
        "Backspace" => named("Backspace", None, 8),
        "Delete" => named("Delete", None, 46),
        "ArrowUp" => named("ArrowUp", None, 38),
        "ArrowDown" => named("ArrowDown", None, 40),
        "ArrowLeft" => named("ArrowLeft", None, 37),
        "ArrowRight" => named("ArrowRight", None, 39),
        "Home" => named("Home", None, 36),
        "End" => named("End", None, 35),
        "PageUp" => named("PageUp", None, 33),
        "PageDown" => named("PageDown", None, 34),
        "Space" | " " => KeyDefinition {
            key: " ".to_string(),
            code: "Space".to_string(),
            text: Some(" ".to_string()),
            key_code: Some(32),
        },
        _ => {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => KeyDefinition {
                    key: key.to_string(),
                    code: format!("Key{}", c.to_ascii_uppercase()),
                    text: Some(key.to_string()),
                    key_code: Some(c.to_ascii_uppercase() as i64),
                },
                (Some(c), None) if c.is_ascii_digit() => KeyDefinition {
                    key: key.to_string(),
                    code: format!("Digit{}", c),
                    text: Some(key.to_string()),
                    key_code: Some(c as i64),
                },
                (Some(_), None) => KeyDefinition {
                    key: key.to_string(),
                    code: String::new(),
                    text: Some(key.to_string()),
                    key_code: None,
                },
                _ => KeyDefinition {
                    key: key.to_string(),
                    code: key.to_string(),
                    text: None,
                    key_code: None,
                },
            }
        }
    }
}

/// Splits `"Control+Shift+A"` into a modifier mask and the final key.
fn parse_chord(chord: &str) -> (i64, &str) {
    if chord == "+" {
        return (0, chord);
    }
    let mut parts: Vec<&str> = chord.split('+').collect();
    let key = parts.pop().unwrap_or_default();
    let mask = parts.iter().fold(0, |mask, part| {
        mask | match part.to_ascii_lowercase().as_str() {
            "alt" | "option" => MODIFIER_ALT,
            "control" | "ctrl" => MODIFIER_CTRL,
            "meta" | "cmd" | "command" => MODIFIER_META,
            "shift" => MODIFIER_SHIFT,
            _ => 0,
        }
    });
    (mask, key)
}

/// Executes one method against a resolved element.
pub struct ActionDispatcher {
    config: ActionConfig,
}

impl ActionDispatcher {
    pub fn new(config: ActionConfig) -> Self {
        Self { config }
    }

    /// Parses `method` against the closed vocabulary, then dispatches.
    /// Unknown names are the only error this returns.
    pub async fn dispatch_named(
        &self,
        handle: &ElementHandle,
        method: &str,
        args: &[String],
    ) -> Result<ActionResult> {
        let method: ActionMethod = method.parse()?;
        Ok(self.dispatch(handle, method, args).await)
    }

    pub async fn dispatch(
        &self,
        handle: &ElementHandle,
        method: ActionMethod,
        args: &[String],
    ) -> ActionResult {
        let started = Instant::now();
        debug!("Dispatching {} on {} ({})", method, handle.xpath, handle.frame_index);

        let outcome = match method {
            ActionMethod::Click => self.click(handle).await,
            ActionMethod::Fill | ActionMethod::Type => self.fill(handle, args, method).await,
            ActionMethod::Press => self.press(handle, args).await,
            ActionMethod::SelectOption => self.select_option(handle, args).await,
            ActionMethod::Hover => self.hover(handle).await,
            ActionMethod::Check => self.set_checked(handle, true).await,
            ActionMethod::Uncheck => self.set_checked(handle, false).await,
            ActionMethod::ScrollTo => self.scroll_to(handle, args).await,
            ActionMethod::NextChunk => self.scroll_chunk(handle, 1).await,
            ActionMethod::PrevChunk => self.scroll_chunk(handle, -1).await,
        };

        let result = outcome.unwrap_or_else(|e| {
            warn!("{} on {} failed: {}", method, handle.xpath, e);
            ActionResult::failure(e.to_string())
        });
        result.with_execution_time(started.elapsed().as_millis() as u64)
    }

    async fn call(&self, handle: &ElementHandle, declaration: &str, args: Vec<Value>) -> Result<Value> {
        let remote = handle
            .session
            .call_function_on(&handle.object_id, declaration, args, true)
            .await?;
        Ok(remote.value.unwrap_or(Value::Null))
    }

    async fn element_center(&self, handle: &ElementHandle) -> Result<(f64, f64)> {
        if let Err(e) = handle
            .session
            .send("DOM.scrollIntoViewIfNeeded", json!({ "objectId": handle.object_id }))
            .await
        {
            debug!("scrollIntoViewIfNeeded failed: {}", e);
        }

        let quads = handle
            .session
            .send("DOM.getContentQuads", json!({ "objectId": handle.object_id }))
            .await?;
        first_quad(&quads).map(|rect| rect.center()).ok_or_else(|| {
            ActionError::ExecutionFailed(format!("{} has no visible box", handle.xpath)).into()
        })
    }

    async fn mouse(&self, handle: &ElementHandle, kind: &str, x: f64, y: f64) -> Result<()> {
        let mut params = json!({ "type": kind, "x": x, "y": y });
        if kind != "mouseMoved" {
            params["button"] = json!("left");
            params["clickCount"] = json!(1);
        }
        handle.session.send("Input.dispatchMouseEvent", params).await?;
        Ok(())
    }

    async fn native_click(&self, handle: &ElementHandle) -> Result<()> {
        let (x, y) = self.element_center(handle).await?;
        self.mouse(handle, "mouseMoved", x, y).await?;
        self.mouse(handle, "mousePressed", x, y).await?;
        self.mouse(handle, "mouseReleased", x, y).await
    }

    async fn click(&self, handle: &ElementHandle) -> Result<ActionResult> {
        let primary = match self.native_click(handle).await {
            Ok(()) => return Ok(ActionResult::success(format!("Clicked {}", handle.xpath))),
            Err(e) => e,
        };
        if !self.config.click_fallback {
            return Err(primary);
        }

        debug!("Native click on {} failed ({}); trying synthetic click", handle.xpath, primary);
        match self.call(handle, SYNTHETIC_CLICK, vec![]).await {
            Ok(_) => Ok(ActionResult::success_with_data(
                format!("Clicked {} via synthetic click", handle.xpath),
                json!({ "fallback": true, "primary_error": primary.to_string() }),
            )),
            Err(fallback) => Err(ActionError::ClickFailed {
                primary: primary.to_string(),
                fallback: fallback.to_string(),
            }
            .into()),
        }
    }

    async fn fill(&self, handle: &ElementHandle, args: &[String], method: ActionMethod) -> Result<ActionResult> {
        let text = required_arg(args, method)?;
        self.call(handle, FOCUS_AND_CLEAR, vec![]).await?;

        if let Err(e) = handle
            .session
            .send("Input.insertText", json!({ "text": text }))
            .await
        {
            debug!("insertText failed ({}); setting value directly", e);
            self.call(handle, SET_VALUE, vec![json!(text)]).await?;
        }
        Ok(ActionResult::success(format!("Filled {} with {:?}", handle.xpath, text)))
    }

    async fn key_event(&self, handle: &ElementHandle, kind: &str, def: &KeyDefinition, modifiers: i64) -> Result<()> {
        let mut params = json!({
            "type": kind,
            "key": def.key,
            "code": def.code,
            "modifiers": modifiers,
        });
        if let Some(vk) = def.key_code {
            params["windowsVirtualKeyCode"] = json!(vk);
            params["nativeVirtualKeyCode"] = json!(vk);
        }
        if kind == "char" {
            params["text"] = json!(def.text);
        }
        handle.session.send("Input.dispatchKeyEvent", params).await?;
        Ok(())
    }

    async fn press(&self, handle: &ElementHandle, args: &[String]) -> Result<ActionResult> {
        let chord = required_arg(args, ActionMethod::Press)?;
        let (modifiers, key) = parse_chord(chord);
        let def = key_definition(key);

        self.call(handle, FOCUS, vec![]).await?;
        self.key_event(handle, "keyDown", &def, modifiers).await?;
        let produces_text = modifiers & (MODIFIER_CTRL | MODIFIER_META | MODIFIER_ALT) == 0;
        if def.text.is_some() && produces_text {
            self.key_event(handle, "char", &def, modifiers).await?;
        }
        if self.config.key_press_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.key_press_delay_ms)).await;
        }
        self.key_event(handle, "keyUp", &def, modifiers).await?;
        Ok(ActionResult::success(format!("Pressed {}", chord)))
    }

    async fn select_option(&self, handle: &ElementHandle, args: &[String]) -> Result<ActionResult> {
        let wanted = required_arg(args, ActionMethod::SelectOption)?;
        let outcome = self.call(handle, SELECT_OPTION, vec![json!(wanted)]).await?;

        if outcome.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(ActionResult::success_with_data(
                format!("Selected {:?}", wanted),
                json!({ "value": outcome.get("value") }),
            ))
        } else {
            let reason = outcome
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("option not selectable");
            Ok(ActionResult::failure(reason.to_string()))
        }
    }

    async fn hover(&self, handle: &ElementHandle) -> Result<ActionResult> {
        let (x, y) = self.element_center(handle).await?;
        self.mouse(handle, "mouseMoved", x, y).await?;
        Ok(ActionResult::success(format!("Hovered {}", handle.xpath)))
    }

    async fn is_checked(&self, handle: &ElementHandle) -> Result<bool> {
        Ok(self.call(handle, IS_CHECKED, vec![]).await?.as_bool().unwrap_or(false))
    }

    async fn set_checked(&self, handle: &ElementHandle, wanted: bool) -> Result<ActionResult> {
        let verb = if wanted { "checked" } else { "unchecked" };
        if self.is_checked(handle).await? == wanted {
            return Ok(ActionResult::success(format!("{} already {}", handle.xpath, verb)));
        }

        let clicked = self.click(handle).await?;
        if self.is_checked(handle).await? == wanted {
            Ok(ActionResult {
                message: format!("{} {}", handle.xpath, verb),
                ..clicked
            })
        } else {
            Ok(ActionResult::failure(format!(
                "{} did not become {} after click",
                handle.xpath, verb
            )))
        }
    }

    async fn scroll_to(&self, handle: &ElementHandle, args: &[String]) -> Result<ActionResult> {
        let percent = parse_percentage(required_arg(args, ActionMethod::ScrollTo)?)?;
        let outcome = self.call(handle, SCROLL_TO_PERCENT, vec![json!(percent)]).await?;

        let scrolled = outcome.get("scrolled").and_then(Value::as_bool).unwrap_or(false);
        let message = if scrolled {
            format!("Scrolled {} to {}%", handle.xpath, percent)
        } else {
            format!("{} is not scrollable; scrolled it into view", handle.xpath)
        };
        Ok(ActionResult::success_with_data(
            message,
            json!({ "percent": percent, "top": outcome.get("top"), "scrolled": scrolled }),
        ))
    }

    async fn scroll_chunk(&self, handle: &ElementHandle, direction: i32) -> Result<ActionResult> {
        let outcome = self
            .call(
                handle,
                SCROLL_CHUNK,
                vec![json!(direction), json!(self.config.scroll_settle_max_frames)],
            )
            .await?;
        let label = if direction > 0 { "forward" } else { "backward" };
        Ok(ActionResult::success_with_data(
            format!("Scrolled {} one viewport {}", handle.xpath, label),
            outcome,
        ))
    }
}
