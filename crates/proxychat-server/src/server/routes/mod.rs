// Route modules for Proxy Chat Server
pub mod websocket; // Chat stream upgrade and session loop
