use crate::core::CdpSession;
use crate::errors::Result;

/// Resolves a synthesized XPath relative to the document it is called on.
///
/// `//` is the shadow-root marker produced by the map builder, not the
/// descendant axis: everything after it is resolved inside the host's
/// shadow root.
pub const RESOLVE_XPATH: &str = r#"function(path) {
    const stepPattern = /^(.*?)\[(\d+)\]$/;
    const walk = (root, part) => {
        let current = root;
        for (const step of part.split('/').filter(Boolean)) {
            if (!current) return null;
            const match = stepPattern.exec(step);
            const name = (match ? match[1] : step).toLowerCase();
            const index = match ? parseInt(match[2], 10) : 1;
            let seen = 0;
            let next = null;
            for (const child of Array.from(current.childNodes || [])) {
                let same = false;
                if (name === 'text()') same = child.nodeType === 3;
                else if (name === 'comment()') same = child.nodeType === 8;
                else same = child.nodeType === 1 && (child.localName || '').toLowerCase() === name;
                if (same && ++seen === index) { next = child; break; }
            }
            current = next;
        }
        return current;
    };
    const parts = String(path).split('//');
    let current = walk(this, parts[0]);
    for (let i = 1; i < parts.length && current; i++) {
        current = current.shadowRoot ? walk(current.shadowRoot, parts[i]) : null;
    }
    return current || null;
}"#;

pub const CONTENT_DOCUMENT: &str =
    "function() { return this.contentDocument || null; }";

/// True once the document the handle belongs to has left `loading`.
pub const DOCUMENT_READY: &str =
    "function() { const doc = this.nodeType === 9 ? this : this.ownerDocument; return !!doc && doc.readyState !== 'loading'; }";

pub const SYNTHETIC_CLICK: &str = r#"function() {
    if (this.scrollIntoView) this.scrollIntoView({ block: 'center', inline: 'center' });
    if (typeof this.click === 'function') {
        this.click();
        return true;
    }
    const view = (this.ownerDocument && this.ownerDocument.defaultView) || window;
    for (const type of ['mousedown', 'mouseup', 'click']) {
        this.dispatchEvent(new MouseEvent(type, { bubbles: true, cancelable: true, view }));
    }
    return true;
}"#;

pub const FOCUS_AND_CLEAR: &str = r#"function() {
    this.focus();
    if ('value' in this && (this.tagName === 'INPUT' || this.tagName === 'TEXTAREA')) {
        this.value = '';
        this.dispatchEvent(new Event('input', { bubbles: true }));
    } else if (this.isContentEditable) {
        this.textContent = '';
    }
    return true;
}"#;

pub const SET_VALUE: &str = r#"function(text) {
    this.focus();
    if (this.isContentEditable && !('value' in this)) {
        this.textContent = text;
    } else {
        const proto = Object.getPrototypeOf(this);
        const setter = Object.getOwnPropertyDescriptor(proto, 'value');
        if (setter && setter.set) setter.set.call(this, text); else this.value = text;
    }
    this.dispatchEvent(new Event('input', { bubbles: true }));
    this.dispatchEvent(new Event('change', { bubbles: true }));
    return true;
}"#;

pub const FOCUS: &str = "function() { if (this.focus) this.focus(); return true; }";

pub const SELECT_OPTION: &str = r#"function(wanted) {
    if (!this.options) return { ok: false, reason: 'element is not a <select>' };
    const target = String(wanted).trim();
    const option = Array.from(this.options).find(o =>
        o.value === target || o.text.trim() === target || o.label === target);
    if (!option) return { ok: false, reason: 'no option matching ' + target };
    this.value = option.value;
    option.selected = true;
    this.dispatchEvent(new Event('input', { bubbles: true }));
    this.dispatchEvent(new Event('change', { bubbles: true }));
    return { ok: true, value: option.value };
}"#;

pub const IS_CHECKED: &str =
    "function() { return !!this.checked || this.getAttribute('aria-checked') === 'true'; }";

/// Scrolls the element (or the page, for `html`/`body`) to `percent` of its
/// scrollable range. Elements without a scrollable range are scrolled into
/// view instead.
pub const SCROLL_TO_PERCENT: &str = r#"function(percent) {
    const doc = this.ownerDocument || document;
    const win = doc.defaultView || window;
    const tag = (this.tagName || '').toLowerCase();
    if (tag === 'html' || tag === 'body') {
        const root = doc.scrollingElement || doc.documentElement;
        const top = (root.scrollHeight - win.innerHeight) * percent / 100;
        win.scrollTo({ top: Math.max(0, top), left: win.scrollX, behavior: 'instant' });
        return { scrolled: true, top: win.scrollY };
    }
    const range = this.scrollHeight - this.clientHeight;
    const style = win.getComputedStyle(this);
    const overflows = /(auto|scroll|overlay)/.test(style.overflowY);
    if (tag === 'iframe' || range <= 0 || !overflows) {
        this.scrollIntoView({ block: 'center', behavior: 'instant' });
        return { scrolled: false, top: this.scrollTop };
    }
    this.scrollTo({ top: range * percent / 100, left: this.scrollLeft, behavior: 'instant' });
    return { scrolled: true, top: this.scrollTop };
}"#;

/// Scrolls one viewport in `direction` (1 or -1) and resolves once two
/// consecutive animation-frame reads of the scroll offset agree.
pub const SCROLL_CHUNK: &str = r#"function(direction, maxFrames) {
    const doc = this.ownerDocument || document;
    const win = doc.defaultView || window;
    const tag = (this.tagName || '').toLowerCase();
    const isRoot = tag === 'html' || tag === 'body';
    const target = isRoot ? (doc.scrollingElement || doc.documentElement) : this;
    const height = isRoot ? win.innerHeight : this.clientHeight;
    const read = () => isRoot ? win.scrollY : target.scrollTop;
    if (isRoot) win.scrollBy({ top: direction * height, behavior: 'smooth' });
    else target.scrollBy({ top: direction * height, behavior: 'smooth' });
    return new Promise(resolve => {
        let last = read();
        let frames = 0;
        const tick = () => {
            const now = read();
            frames += 1;
            if ((now === last && frames > 1) || frames >= maxFrames) {
                resolve({ top: now, frames });
                return;
            }
            last = now;
            win.requestAnimationFrame(tick);
        };
        win.requestAnimationFrame(tick);
    });
}"#;

/// Called on a document: positional XPaths of every element whose content
/// overflows and can be scrolled by the user.
pub const SCROLLABLE_XPATHS: &str = r#"function() {
    const doc = this.nodeType === 9 ? this : this.ownerDocument;
    const win = doc.defaultView;
    if (!win) return [];
    const pathOf = (el) => {
        const parts = [];
        let node = el;
        while (node && node.nodeType === 1) {
            let index = 1;
            for (let sib = node.previousSibling; sib; sib = sib.previousSibling) {
                if (sib.nodeType === 1 && sib.localName === node.localName) index++;
            }
            parts.unshift(node.localName + '[' + index + ']');
            node = node.parentNode;
        }
        return '/' + parts.join('/');
    };
    const out = [];
    const root = doc.scrollingElement || doc.documentElement;
    if (root && root.scrollHeight > root.clientHeight) out.push(pathOf(root));
    for (const el of doc.querySelectorAll('body *')) {
        const style = win.getComputedStyle(el);
        if (/(auto|scroll|overlay)/.test(style.overflowY) && el.scrollHeight > el.clientHeight) {
            out.push(pathOf(el));
        }
    }
    return out;
}"#;

pub const OVERLAY_SHOW: &str = r#"(boxes) => {
    const layer = document.createElement('div');
    layer.id = '__browser_locator_overlay';
    layer.style.cssText = 'position:fixed;inset:0;pointer-events:none;z-index:2147483647';
    for (const b of boxes) {
        const box = document.createElement('div');
        box.style.cssText = `position:fixed;left:${b.x}px;top:${b.y}px;width:${b.width}px;height:${b.height}px;outline:2px solid #e4572e`;
        const tag = document.createElement('span');
        tag.textContent = b.id;
        tag.style.cssText = 'position:absolute;top:-14px;left:0;font:10px monospace;background:#e4572e;color:#fff;padding:0 2px';
        box.appendChild(tag);
        layer.appendChild(box);
    }
    document.documentElement.appendChild(layer);
    return boxes.length;
}"#;

pub const OVERLAY_CLEAR: &str =
    "(() => { const el = document.getElementById('__browser_locator_overlay'); if (el) el.remove(); return true; })()";

pub struct JavaScriptRunner;

impl JavaScriptRunner {
    /// Polls `condition` (a function declaration returning a boolean) on
    /// `object_id` until it holds or `timeout_ms` elapses.
    pub async fn wait_for_condition(
        session: &dyn CdpSession,
        object_id: &str,
        condition: &str,
        timeout_ms: u64,
        poll_interval_ms: u64,
    ) -> Result<bool> {
        let start_time = tokio::time::Instant::now();
        let timeout = tokio::time::Duration::from_millis(timeout_ms);
        let poll_interval = tokio::time::Duration::from_millis(poll_interval_ms);

        while start_time.elapsed() < timeout {
            let result = session
                .call_function_on(object_id, condition, vec![], true)
                .await?;
            if result.as_bool() == Some(true) {
                return Ok(true);
            }

            tokio::time::sleep(poll_interval).await;
        }

        Ok(false)
    }
}
