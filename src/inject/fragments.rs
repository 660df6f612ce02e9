//! Bootstrap clients compiled into the binary.
//!
//! Placeholders of the form `__CRXKIT_NAME__` are replaced with JSON string
//! literals at injection time. Each client ends with `return hot;`, the
//! handle application code reaches as `import.meta.hot`.

/// Content scripts: no runtime-built code, no globals. Hot modules are loaded
/// from the packaged `crxkit-hmr/` directory and handed to the callbacks
/// registered for them. An update nobody accepted reloads the page.
pub const CONTENT_SCRIPT_CLIENT: &str = r#"const url = __CRXKIT_HMR_URL__;
const contextId = __CRXKIT_CONTEXT_ID__;
const hmrDir = __CRXKIT_HMR_DIR__;
const accepted = new Map();
const hot = {
  accept(id, callback) {
    accepted.set(id, [...(accepted.get(id) || []), callback]);
  },
};
const apply = async (modules) => {
  for (const m of modules) {
    const callbacks = accepted.get(m.id);
    if (!callbacks) throw new Error('no handler accepts ' + m.id);
    const next = await import(chrome.runtime.getURL(hmrDir + '/' + m.url + '?t=' + m.hash));
    callbacks.forEach((callback) => callback(next));
  }
};
const connect = (delay) => {
  const socket = new WebSocket(url);
  socket.addEventListener('open', () => {
    socket.send(JSON.stringify({ type: 'hello', contextId, url: location.href }));
  });
  socket.addEventListener('message', async (event) => {
    const msg = JSON.parse(event.data);
    if (msg.type === 'update') {
      try {
        await apply(msg.modules);
        socket.send(JSON.stringify({ type: 'applied' }));
      } catch (err) {
        console.warn('[crxkit] hot update failed, reloading', err);
        location.reload();
      }
    } else if (msg.type === 'full-reload') {
      location.reload();
    } else if (msg.type === 'prune') {
      socket.close(1000);
    }
  });
  socket.addEventListener('close', (event) => {
    if (event.code !== 1000) {
      setTimeout(() => connect(Math.min(delay * 2, 8000)), delay);
    }
  });
};
connect(500);
return hot;"#;

/// Ephemeral background worker: every start is a cold start. Applying any
/// update means restarting the worker; the marker for that lives in
/// `chrome.storage`, never in worker memory. The channel reconnects with
/// backoff while the worker stays alive.
pub const WORKER_CLIENT: &str = r#"const url = __CRXKIT_HMR_URL__;
const contextId = __CRXKIT_CONTEXT_ID__;
const pendingKey = 'crxkit:pending';
const hot = { accept() {} };
const connect = (delay) => {
  const socket = new WebSocket(url);
  socket.addEventListener('open', async () => {
    socket.send(JSON.stringify({ type: 'hello', contextId }));
    const stored = await chrome.storage.local.get(pendingKey);
    if (stored[pendingKey]) {
      await chrome.storage.local.remove(pendingKey);
      socket.send(JSON.stringify({ type: 'applied' }));
    }
  });
  socket.addEventListener('message', async (event) => {
    const msg = JSON.parse(event.data);
    if (msg.type === 'update' || msg.type === 'full-reload') {
      await chrome.storage.local.set({ [pendingKey]: msg.type });
      chrome.runtime.reload();
    } else if (msg.type === 'prune') {
      socket.close(1000);
    }
  });
  socket.addEventListener('close', (event) => {
    if (event.code !== 1000) {
      setTimeout(() => connect(Math.min(delay * 2, 8000)), delay);
    }
  });
};
connect(500);
return hot;"#;

/// Extension pages: reconnecting client with live module replacement.
pub const PAGE_CLIENT: &str = r#"const url = __CRXKIT_HMR_URL__;
const contextId = __CRXKIT_CONTEXT_ID__;
const origin = __CRXKIT_ORIGIN__;
const accepted = new Map();
const hot = {
  accept(id, callback) {
    accepted.set(id, [...(accepted.get(id) || []), callback]);
  },
};
let delay = 500;
const connect = () => {
  const socket = new WebSocket(url);
  socket.addEventListener('open', () => {
    delay = 500;
    socket.send(JSON.stringify({ type: 'hello', contextId, url: location.href }));
  });
  socket.addEventListener('message', async (event) => {
    const msg = JSON.parse(event.data);
    switch (msg.type) {
      case 'update':
        try {
          for (const m of msg.modules) {
            const callbacks = accepted.get(m.id);
            if (!callbacks) throw new Error('no handler accepts ' + m.id);
            const next = await import(`${origin}/@module/${m.url}?t=${m.hash}`);
            callbacks.forEach((callback) => callback(next));
          }
          socket.send(JSON.stringify({ type: 'applied' }));
        } catch (err) {
          console.warn('[crxkit] hot update failed, reloading', err);
          location.reload();
        }
        break;
      case 'full-reload':
        location.reload();
        break;
      case 'prune':
        socket.close(1000);
        break;
    }
  });
  socket.addEventListener('close', (event) => {
    if (event.code === 1000) return;
    setTimeout(connect, delay);
    delay = Math.min(delay * 2, 8000);
  });
};
connect();
return hot;"#;
