//! 前端端口：前端一侧的类型化收发
//!
//! 订阅 FRONTEND（广播的 SWITCH_AGENT 也会收到），发出的信封都以 Frontend 为 sender、SESSION 为目标。
//! 收到 HANDOVER_UI_PROMPT 时记下 tx_id，之后的确认 / 拒绝自动带上。

use crate::core::BusError;
use crate::message::{
    AgentId, AgentRequest, Body, CancelRequest, Control, Envelope, MessageBus, MessageFactory, Participant,
    Subscription, Target, TurnId, TxId, UserInput,
};

pub struct FrontendPort {
    bus: MessageBus,
    factory: MessageFactory,
    inbox: Subscription,
    pending_handover: Option<TxId>,
}

impl FrontendPort {
    pub async fn attach(bus: &MessageBus) -> Result<Self, BusError> {
        let inbox = bus.subscribe("frontend", Target::Frontend, false).await?;
        Ok(Self {
            bus: bus.clone(),
            factory: MessageFactory::new(bus.session_id()),
            inbox,
            pending_handover: None,
        })
    }

    pub fn session_id(&self) -> &str {
        self.factory.session_id()
    }

    /// 发送用户输入，返回本轮 turn_id
    pub async fn send_input(&self, input: UserInput) -> Result<TurnId, BusError> {
        let turn_id = MessageFactory::new_turn_id();
        let env = self.factory.user_input(input).with_turn(Some(turn_id.clone()));
        self.bus.publish(env).await?;
        Ok(turn_id)
    }

    pub async fn say(&self, text: &str) -> Result<TurnId, BusError> {
        self.send_input(UserInput::text(text)).await
    }

    /// 结构化提及
    pub async fn say_to(&self, agent_id: &str, text: &str) -> Result<TurnId, BusError> {
        let mut input = UserInput::text(text);
        input.mentioned_agent_id = Some(agent_id.to_string());
        self.send_input(input).await
    }

    async fn control(&self, control: Control, tx_id: Option<TxId>) -> Result<(), BusError> {
        let env = self
            .factory
            .control(Participant::Frontend, Target::Session, control)
            .with_tx(tx_id)
            .with_trace(Some(MessageFactory::new_trace_id()));
        self.bus.publish(env).await.map(|_| ())
    }

    pub async fn cancel(&self, reason: Option<String>) -> Result<(), BusError> {
        self.control(Control::Cancel(CancelRequest { reason }), None).await
    }

    pub async fn switch_agent(&self, to: &str) -> Result<(), BusError> {
        let control = Control::SwitchAgent {
            from: None,
            to: Some(to.to_string()),
            reason: Some("user_selection".to_string()),
        };
        self.control(control, None).await
    }

    pub async fn add_agent(&self, agent_id: &str) -> Result<(), BusError> {
        let req = AgentRequest {
            agent_id: agent_id.to_string(),
            reason: None,
        };
        self.control(Control::RequestAddAgent(req), None).await
    }

    pub async fn remove_agent(&self, agent_id: &str) -> Result<(), BusError> {
        let req = AgentRequest {
            agent_id: agent_id.to_string(),
            reason: None,
        };
        self.control(Control::RequestRemoveAgent(req), None).await
    }

    /// 确认交接；`to_agent` 为空时沿用请求中的目标
    pub async fn accept_handover(&mut self, to_agent: Option<AgentId>) -> Result<(), BusError> {
        let tx_id = self.pending_handover.take();
        self.control(Control::HandoverConfirm { to_agent }, tx_id).await
    }

    pub async fn reject_handover(&mut self, reason: Option<String>) -> Result<(), BusError> {
        let tx_id = self.pending_handover.take();
        self.control(Control::HandoverReject { reason }, tx_id).await
    }

    pub async fn open(&self, agents: Vec<AgentId>) -> Result<(), BusError> {
        self.control(Control::RequestSessionOpen { agents }, None).await
    }

    pub async fn close(&self, reason: Option<String>) -> Result<(), BusError> {
        self.control(Control::RequestSessionClose { reason }, None).await
    }

    pub fn pending_handover(&self) -> Option<&str> {
        self.pending_handover.as_deref()
    }

    /// 下一条发给前端的信封；总线关闭后返回 None
    pub async fn recv(&mut self) -> Option<Envelope> {
        let env = self.inbox.recv().await?;
        self.track(&env);
        Some(env)
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        let env = self.inbox.try_recv()?;
        self.track(&env);
        Some(env)
    }

    fn track(&mut self, env: &Envelope) {
        if let Body::Control(Control::HandoverUiPrompt { .. }) = env.body {
            self.pending_handover = env.tx_id.clone();
        }
    }
}
